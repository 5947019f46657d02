//! Minimal static dev server over the output directory. Serves whatever the
//! build wrote; no live-reload socket.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::core::options::DevServerOptions;
use crate::utils::mime::MimeRegistry;
use crate::utils::{Logger, Result};

pub struct DevServer {
    root: PathBuf,
    options: DevServerOptions,
    mime: Arc<MimeRegistry>,
}

impl DevServer {
    pub fn new(root: PathBuf, options: DevServerOptions, mime: Arc<MimeRegistry>) -> Self {
        Self {
            root,
            options,
            mime,
        }
    }

    /// Accept loop; one task per connection.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let address = format!("{}:{}", self.options.host, self.options.port);
        let listener = TcpListener::bind(&address).await?;
        Logger::info(&format!(
            "dev server on http://{} serving {}",
            address,
            self.root.display()
        ));

        loop {
            let (stream, _) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(err) = server.handle(stream).await {
                    Logger::debug(&format!("connection error: {}", err));
                }
            });
        }
    }

    async fn handle(&self, mut stream: TcpStream) -> Result<()> {
        let mut buffer = vec![0u8; 8192];
        let read = stream.read(&mut buffer).await?;
        let request = String::from_utf8_lossy(&buffer[..read]);

        let target = request
            .lines()
            .next()
            .and_then(|line| line.split_whitespace().nth(1))
            .unwrap_or("/");
        let path = target.split(['?', '#']).next().unwrap_or("/");

        match self.resolve(path) {
            Some(file) => {
                let body = tokio::fs::read(&file).await;
                match body {
                    Ok(body) => {
                        let ext = file
                            .extension()
                            .and_then(|e| e.to_str())
                            .unwrap_or_default();
                        let mime = self.mime.lookup(ext);
                        respond(&mut stream, 200, "OK", &mime, &body).await?;
                    }
                    Err(_) => {
                        respond(&mut stream, 404, "Not Found", "text/plain", b"not found")
                            .await?;
                    }
                }
            }
            None => {
                respond(&mut stream, 403, "Forbidden", "text/plain", b"forbidden").await?;
            }
        }
        Ok(())
    }

    /// Map a request path into the served root, refusing traversal.
    fn resolve(&self, request_path: &str) -> Option<PathBuf> {
        let trimmed = request_path.trim_start_matches('/');
        let relative = Path::new(trimmed);
        if relative
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
        {
            return None;
        }
        let mut file = self.root.join(relative);
        if file.is_dir() {
            file = file.join("index.html");
        }
        Some(file)
    }
}

async fn respond(
    stream: &mut TcpStream,
    status: u16,
    reason: &str,
    mime: &str,
    body: &[u8],
) -> Result<()> {
    let header = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status,
        reason,
        mime,
        body.len()
    );
    stream.write_all(header.as_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await?;
    Ok(())
}
