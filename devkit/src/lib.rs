/*!
# Viper DevKit - Doublures réseau pour tester le kernel

Bibliothèque de test du kernel avec:
- Datastore REST en mémoire (dialecte PostgREST)
- Source upstream servant un export JSON configurable
- Cibles TCP/HTTP locales pour les sondes de santé
- Builder d'enregistrements de nœuds
*/

pub mod fixtures;
pub mod mock_datastore;
pub mod mock_upstream;
pub mod probe_targets;

pub use fixtures::{days_ago, NodeFixture};
pub use mock_datastore::MockDatastore;
pub use mock_upstream::MockUpstream;

/// Active les logs des doublures (RUST_LOG), sans effet si déjà fait.
pub fn init_logging() {
    env_logger::builder().is_test(true).try_init().ok();
}
