use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use wasm_bootstrap::{ErrorCategory, LoadError, LoadState, Loader, Manifest};

mod common;

/// Serve fixed bodies over HTTP/1.1 on a local port. Unknown paths get a 404.
async fn start_server(routes: HashMap<&'static str, Vec<u8>>) -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let routes = Arc::new(routes);
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = listener.accept().await.unwrap();
            let routes = routes.clone();
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = stream.read(&mut buf).await.unwrap();
                    if n == 0 {
                        return;
                    }
                    request.extend_from_slice(&buf[..n]);
                }
                let head = String::from_utf8_lossy(&request);
                let path = head.split_whitespace().nth(1).unwrap_or("/").to_string();

                let (status, body) = match routes.get(path.as_str()) {
                    Some(body) => ("200 OK", body.clone()),
                    None => ("404 Not Found", Vec::new()),
                };
                let header = format!(
                    "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                stream.write_all(header.as_bytes()).await.unwrap();
                stream.write_all(&body).await.unwrap();
                stream.shutdown().await.unwrap();
            });
        }
    });
    port
}

fn http_loader(public_path: String) -> Loader {
    Loader::builder(common::manifest().with_public_path(public_path))
        .with_deferred_module(common::GLUE, |_| async { Ok(common::glue()) })
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_chunk_loads_over_http() {
    let port = start_server(HashMap::from([
        ("/1.bootstrap.js", common::payload_json(&["1"], &[common::GLUE])),
        ("/abc123.module.wasm", common::adder_wasm()),
    ]))
    .await;
    let loader = http_loader(format!("http://127.0.0.1:{port}/"));

    loader.ensure("1").await.unwrap();
    assert_eq!(loader.chunk_state("1"), LoadState::Loaded);
    let exports = loader.exports(common::ADDER).unwrap();
    assert_eq!(exports.call_i32("compute", &[4]).await.unwrap(), Some(9));

    let error = loader.ensure("2").await.unwrap_err();
    common::assert_missing(&error, &format!("http://127.0.0.1:{port}/2.bootstrap.js"));
    assert_eq!(loader.chunk_state("2"), LoadState::NotRequested);
}

#[tokio::test]
async fn test_refused_connection_is_transport_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    let loader = http_loader(format!("http://127.0.0.1:{port}/"));

    let error = loader.ensure("2").await.unwrap_err();
    assert!(matches!(error, LoadError::Transport { .. }), "{error:?}");
    assert_eq!(error.category(), Some(ErrorCategory::Error));
    assert!(
        error
            .to_string()
            .starts_with("Loading chunk 2 failed.\n(error: "),
        "{error}"
    );
}

#[tokio::test]
async fn test_https_public_path_is_transport_error() {
    let manifest = Manifest::from_toml_str(
        r#"
        public_path = "https://cdn.example.invalid/app/"
    "#,
    )
    .unwrap();
    let loader = Loader::builder(manifest).build().unwrap();

    let error = loader.ensure("2").await.unwrap_err();
    assert_eq!(error.category(), Some(ErrorCategory::Error));
    match error {
        LoadError::Transport {
            request, reason, ..
        } => {
            assert_eq!(request, "https://cdn.example.invalid/app/2.bootstrap.js");
            assert!(reason.contains("Unsupported scheme 'https'"), "{reason}");
        }
        other => panic!("expected a transport error, got {other:?}"),
    }
}
