use anyhow::{Context, Result, anyhow};
use pixelmuse_core::{BackendConfig, BackendResponse};
use reqwest::blocking::Client;
use reqwest::blocking::multipart::{Form, Part};
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Client-side view of the image-generation service.
///
/// Both submission calls return the service's `BackendResponse` shape even on
/// HTTP error statuses, because the service reports application errors as an
/// `{"error": ...}` body (a 500 with an error body is an application error,
/// not a transport failure). Only network and parse failures surface as `Err`.
pub trait ImageBackend: Send + Sync {
    /// Text-to-image: POST JSON `{"prompt": ...}` to `/generate`.
    fn generate(&self, prompt: &str) -> Result<BackendResponse>;

    /// Image editing: POST multipart (`file`, `prompt`) to `/edit`.
    fn edit(&self, image: &Path, prompt: &str) -> Result<BackendResponse>;

    /// Raw bytes of a generated image, by canonical path.
    fn fetch_image(&self, filename: &str) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone)]
pub struct HttpBackend {
    base_url: String,
    client: Client,
}

impl HttpBackend {
    pub fn new(cfg: &BackendConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .build()?;
        Ok(Self {
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn parse_response(body: &str) -> Result<BackendResponse> {
        serde_json::from_str(body).with_context(|| format!("unparseable backend response: {body}"))
    }
}

/// Canonical path by which a generated image's bytes are retrieved.
pub fn image_url(base_url: &str, filename: &str) -> String {
    format!("{}/image/{filename}", base_url.trim_end_matches('/'))
}

impl ImageBackend for HttpBackend {
    fn generate(&self, prompt: &str) -> Result<BackendResponse> {
        let body = self
            .client
            .post(self.endpoint("/generate"))
            .json(&json!({ "prompt": prompt }))
            .send()?
            .text()?;
        Self::parse_response(&body)
    }

    fn edit(&self, image: &Path, prompt: &str) -> Result<BackendResponse> {
        let filename = image
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "image.png".to_string());
        let bytes = fs::read(image)
            .with_context(|| format!("reading attached image {}", image.display()))?;
        let file_part = Part::bytes(bytes)
            .file_name(filename)
            .mime_str("image/png")?;
        let form = Form::new()
            .part("file", file_part)
            .text("prompt", prompt.to_string());
        let body = self
            .client
            .post(self.endpoint("/edit"))
            .multipart(form)
            .send()?
            .text()?;
        Self::parse_response(&body)
    }

    fn fetch_image(&self, filename: &str) -> Result<Vec<u8>> {
        let resp = self.client.get(image_url(&self.base_url, filename)).send()?;
        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!("image fetch for {filename} returned {status}"));
        }
        Ok(resp.bytes()?.to_vec())
    }
}

/// Fetch an image and save it under `dir` with its original filename.
pub fn download_image(backend: &dyn ImageBackend, filename: &str, dir: &Path) -> Result<PathBuf> {
    let name = safe_filename(filename)?;
    let bytes = backend.fetch_image(filename)?;
    fs::create_dir_all(dir)?;
    let dest = dir.join(name);
    fs::write(&dest, bytes).with_context(|| format!("writing {}", dest.display()))?;
    Ok(dest)
}

/// A service-supplied filename is only ever joined onto a local directory if
/// it is a bare name. Separators or `..` components are rejected.
pub fn safe_filename(filename: &str) -> Result<&str> {
    match Path::new(filename).file_name().and_then(|n| n.to_str()) {
        Some(name) if name == filename => Ok(name),
        _ => Err(anyhow!("unsafe image filename from backend: {filename}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pixelmuse_core::Outcome;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    /// One-shot HTTP server: accepts a single connection, reads the full
    /// request (headers plus Content-Length body), replies with `status_line`
    /// and `body`, and hands the raw request back for assertions.
    fn spawn_server(
        status_line: &'static str,
        content_type: &'static str,
        body: Vec<u8>,
    ) -> (String, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            stream
                .set_read_timeout(Some(Duration::from_secs(2)))
                .expect("timeout");
            let mut request = Vec::new();
            let mut buf = [0_u8; 8192];
            loop {
                let n = match stream.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(_) => break,
                };
                request.extend_from_slice(&buf[..n]);
                if request_complete(&request) {
                    break;
                }
            }
            let response = format!(
                "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            let _ = stream.write_all(response.as_bytes());
            let _ = stream.write_all(&body);
            String::from_utf8_lossy(&request).to_string()
        });
        (format!("http://{addr}"), handle)
    }

    fn request_complete(raw: &[u8]) -> bool {
        let text = String::from_utf8_lossy(raw);
        let Some(header_end) = text.find("\r\n\r\n") else {
            return false;
        };
        let content_length = text
            .lines()
            .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length: ").map(str::to_string))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        raw.len() >= header_end + 4 + content_length
    }

    fn backend_for(base_url: &str) -> HttpBackend {
        HttpBackend::new(&BackendConfig {
            base_url: base_url.to_string(),
            timeout_seconds: 5,
        })
        .expect("client")
    }

    #[test]
    fn generate_posts_prompt_json() {
        let (base, server) = spawn_server(
            "HTTP/1.1 200 OK",
            "application/json",
            br#"{"message":"ok","filenames":["a.png","b.png"]}"#.to_vec(),
        );
        let backend = backend_for(&base);
        let resp = backend.generate("a red fox").expect("generate");

        let request = server.join().expect("join");
        assert!(request.contains("POST /generate"));
        assert!(request.contains(r#"{"prompt":"a red fox"}"#));
        assert!(request.to_ascii_lowercase().contains("content-type: application/json"));
        assert_eq!(
            resp.interpret(),
            Outcome::Images(vec!["a.png".to_string(), "b.png".to_string()])
        );
    }

    #[test]
    fn edit_posts_multipart_file_and_prompt() {
        let dir = tempfile::tempdir().expect("tempdir");
        let image = dir.path().join("fox.png");
        fs::write(&image, b"\x89PNG fake bytes").expect("write image");

        let (base, server) = spawn_server(
            "HTTP/1.1 200 OK",
            "application/json",
            br#"{"message":"ok","filenames":["result_1.png"]}"#.to_vec(),
        );
        let backend = backend_for(&base);
        let resp = backend.edit(&image, "make it blue").expect("edit");

        let request = server.join().expect("join");
        assert!(request.contains("POST /edit"));
        assert!(request.contains("multipart/form-data"));
        assert!(request.contains(r#"name="file""#));
        assert!(request.contains(r#"filename="fox.png""#));
        assert!(request.contains(r#"name="prompt""#));
        assert!(request.contains("make it blue"));
        assert_eq!(
            resp.interpret(),
            Outcome::Images(vec!["result_1.png".to_string()])
        );
    }

    #[test]
    fn error_body_on_error_status_is_an_application_error() {
        // The service reports generation failures as 500 + {"error": ...};
        // that must surface as a verbatim error bubble, not a transport error.
        let (base, server) = spawn_server(
            "HTTP/1.1 500 Internal Server Error",
            "application/json",
            br#"{"error":"No image generated"}"#.to_vec(),
        );
        let backend = backend_for(&base);
        let resp = backend.generate("a red fox").expect("generate");
        server.join().expect("join");
        assert_eq!(
            resp.interpret(),
            Outcome::Error("No image generated".to_string())
        );
    }

    #[test]
    fn unparseable_body_is_a_transport_failure() {
        let (base, server) = spawn_server(
            "HTTP/1.1 200 OK",
            "text/html",
            b"<html>gateway error</html>".to_vec(),
        );
        let backend = backend_for(&base);
        let err = backend.generate("a red fox").expect_err("should fail");
        server.join().expect("join");
        assert!(err.to_string().contains("unparseable backend response"));
    }

    #[test]
    fn connection_refused_is_a_transport_failure() {
        // Bind then drop to get a port with nothing listening.
        let dead = {
            let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
            listener.local_addr().expect("addr")
        };
        let backend = backend_for(&format!("http://{dead}"));
        assert!(backend.generate("a red fox").is_err());
    }

    #[test]
    fn fetch_image_returns_raw_bytes() {
        let png = b"\x89PNG raw image".to_vec();
        let (base, server) = spawn_server("HTTP/1.1 200 OK", "image/png", png.clone());
        let backend = backend_for(&base);
        let bytes = backend.fetch_image("a.png").expect("fetch");

        let request = server.join().expect("join");
        assert!(request.contains("GET /image/a.png"));
        assert_eq!(bytes, png);
    }

    #[test]
    fn fetch_image_rejects_missing_files() {
        let (base, server) = spawn_server(
            "HTTP/1.1 404 Not Found",
            "application/json",
            br#"{"error":"File not found"}"#.to_vec(),
        );
        let backend = backend_for(&base);
        let err = backend.fetch_image("gone.png").expect_err("should fail");
        server.join().expect("join");
        assert!(err.to_string().contains("gone.png"));
    }

    #[test]
    fn download_saves_under_original_filename() {
        let png = b"\x89PNG raw image".to_vec();
        let (base, server) = spawn_server("HTTP/1.1 200 OK", "image/png", png.clone());
        let backend = backend_for(&base);
        let dir = tempfile::tempdir().expect("tempdir");
        let dest =
            download_image(&backend, "result_42.png", dir.path()).expect("download");
        server.join().expect("join");
        assert_eq!(dest, dir.path().join("result_42.png"));
        assert_eq!(fs::read(dest).expect("read saved"), png);
    }

    #[test]
    fn download_rejects_filenames_with_path_components() {
        struct NoFetch;
        impl ImageBackend for NoFetch {
            fn generate(&self, _: &str) -> Result<pixelmuse_core::BackendResponse> {
                unreachable!("no request expected")
            }
            fn edit(&self, _: &Path, _: &str) -> Result<pixelmuse_core::BackendResponse> {
                unreachable!("no request expected")
            }
            fn fetch_image(&self, _: &str) -> Result<Vec<u8>> {
                unreachable!("must be rejected before any fetch")
            }
        }
        let dir = tempfile::tempdir().expect("tempdir");
        for name in ["../evil.png", "a/b.png", "/etc/passwd", "..", ""] {
            assert!(download_image(&NoFetch, name, dir.path()).is_err());
        }
    }

    #[test]
    fn safe_filename_accepts_only_bare_names() {
        assert_eq!(safe_filename("result_1.png").expect("bare name"), "result_1.png");
        assert!(safe_filename("../result_1.png").is_err());
        assert!(safe_filename("sub/result_1.png").is_err());
    }

    #[test]
    fn image_url_handles_trailing_slash() {
        assert_eq!(
            image_url("http://img.local:9000/", "a.png"),
            "http://img.local:9000/image/a.png"
        );
    }
}
