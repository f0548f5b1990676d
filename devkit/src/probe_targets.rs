/*!
Cibles locales pour les sondes TCP/HTTP.

Chaque cible vit tant que la valeur retournée n'est pas droppée.
*/

use anyhow::Result;
use axum::{http::StatusCode, Router};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub struct ProbeTarget {
    pub port: u16,
    task: JoinHandle<()>,
}

impl Drop for ProbeTarget {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Accepte les connexions TCP et les referme aussitôt.
pub async fn spawn_tcp_listener() -> Result<ProbeTarget> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let task = tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            drop(stream);
        }
    });
    Ok(ProbeTarget { port, task })
}

/// Répond `status` à toute requête HTTP, HEAD compris.
pub async fn spawn_http_responder(status: u16) -> Result<ProbeTarget> {
    let status = StatusCode::from_u16(status)?;
    let app = Router::new().fallback(move || async move { status });

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            log::error!("http responder stopped: {}", e);
        }
    });
    Ok(ProbeTarget { port, task })
}

/// Port qui vient d'être libéré : une connexion y est refusée.
pub async fn refused_port() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}
