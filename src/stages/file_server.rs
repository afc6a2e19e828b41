//! Static file serving from one or more mapped directories.

use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::http::date::fmt_http_date;
use crate::http::{Request, Response, StatusCode};
use crate::stage::{BoxFuture, Next, Stage, StageError, StageResult};

/// Files are cached by clients for a year.
const EXPIRES_AFTER_DAYS: i64 = 365;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Content type for a file name, by extension.
pub fn content_type_for(file_name: &str) -> &'static str {
    let Some((_, extension)) = file_name.rsplit_once('.') else {
        return DEFAULT_CONTENT_TYPE;
    };
    match extension.to_ascii_lowercase().as_str() {
        "txt" => "text/plain",
        "html" => "text/html",
        "xml" => "text/xml",
        "css" => "text/css",
        "js" => "text/javascript",
        "json" => "application/json",
        "png" => "image/png",
        "svg" => "image/svg+xml",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "tiff" => "image/tiff",
        "ico" => "image/x-icon",
        _ => DEFAULT_CONTENT_TYPE,
    }
}

/// How a request path relates to one mount.
enum Lookup {
    Unmapped,
    /// Under the prefix, but nothing to serve (no default file).
    Missing,
    /// The remainder names something outside the mapped directory.
    Outside,
    File(PathBuf),
}

/// Joins `relative` onto `directory` one normal component at a time.
///
/// Returns `None` for roots, prefixes and parent components, any of which
/// would let the result leave `directory`.
fn confine(directory: &Path, relative: &str) -> Option<PathBuf> {
    let mut path = directory.to_path_buf();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) | Component::ParentDir => return None,
        }
    }
    Some(path)
}

#[derive(Debug, Clone)]
struct Mount {
    base_url: String,
    directory: PathBuf,
}

/// Serves files from directories mapped onto URL prefixes.
///
/// A request under a mapped prefix whose file does not exist is answered
/// with 404, unless [`fall_through`](Self::fall_through) is set, in which
/// case it is passed on. Requests outside every prefix always pass.
///
/// # Examples
///
/// ```rust,no_run
/// use capsela::stages::FileServer;
///
/// let files = FileServer::new("/static", "./public")
///     .mount("/docs", "./target/doc")
///     .default_file("index.html");
/// ```
#[derive(Debug, Clone)]
pub struct FileServer {
    mounts: Vec<Mount>,
    default_file: Option<String>,
    fall_through: bool,
}

impl FileServer {
    /// Maps `directory` onto `base_url`.
    pub fn new(base_url: impl Into<String>, directory: impl Into<PathBuf>) -> Self {
        Self {
            mounts: Vec::new(),
            default_file: None,
            fall_through: false,
        }
        .mount(base_url, directory)
    }

    /// Adds another mapping. Mappings are tried in the order they were added.
    #[must_use]
    pub fn mount(mut self, base_url: impl Into<String>, directory: impl Into<PathBuf>) -> Self {
        let base_url = base_url.into();
        let base_url = if base_url.starts_with('/') {
            base_url
        } else {
            format!("/{base_url}")
        };
        self.mounts.push(Mount {
            base_url,
            directory: directory.into(),
        });
        self
    }

    /// File served for requests naming a mapped directory itself.
    #[must_use]
    pub fn default_file(mut self, name: impl Into<String>) -> Self {
        self.default_file = Some(name.into());
        self
    }

    /// Pass requests on instead of answering 404 when a mapped prefix
    /// matches but the file is missing.
    #[must_use]
    pub fn fall_through(mut self, fall_through: bool) -> Self {
        self.fall_through = fall_through;
        self
    }

    fn locate(&self, mount: &Mount, path: &str) -> Lookup {
        let relative = if path == mount.base_url {
            ""
        } else {
            let prefix = if mount.base_url.ends_with('/') {
                mount.base_url.clone()
            } else {
                format!("{}/", mount.base_url)
            };
            match path.strip_prefix(prefix.as_str()) {
                Some(relative) => relative,
                None => return Lookup::Unmapped,
            }
        };

        if !relative.is_empty() {
            return match confine(&mount.directory, relative) {
                Some(file) => Lookup::File(file),
                None => Lookup::Outside,
            };
        }
        match &self.default_file {
            Some(name) => Lookup::File(mount.directory.join(name)),
            None => Lookup::Missing,
        }
    }

    async fn serve_file(&self, path: PathBuf) -> Result<Option<Response>, StageError> {
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(_) => return Ok(None),
        };
        let metadata = file.metadata().await?;
        if !metadata.is_file() {
            return Ok(None);
        }

        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let expires = Utc::now() + Duration::days(EXPIRES_AFTER_DAYS);

        let mut response = Response::new(StatusCode::OK)
            .header("Content-Type", content_type_for(&name))
            .header("Expires", fmt_http_date(expires))
            .stream(file, Some(metadata.len()));
        if let Ok(modified) = metadata.modified() {
            response = response.last_modified(DateTime::<Utc>::from(modified));
        }

        debug!(path = %path.display(), bytes = metadata.len(), "serving file");
        Ok(Some(response))
    }
}

impl Stage for FileServer {
    fn service<'a>(&'a self, request: &'a mut Request, next: Next<'a>) -> BoxFuture<'a, StageResult> {
        Box::pin(async move {
            let path = request.path().to_owned();
            if path.contains("..") {
                return Ok(Some(
                    Response::new(StatusCode::FORBIDDEN).body("can't use .. in path"),
                ));
            }

            let mut not_found = false;
            for mount in &self.mounts {
                match self.locate(mount, &path) {
                    Lookup::Unmapped => continue,
                    Lookup::Missing => not_found = true,
                    Lookup::Outside => {
                        return Ok(Some(
                            Response::new(StatusCode::FORBIDDEN).body("path leaves the mapped directory"),
                        ));
                    }
                    Lookup::File(file) => match self.serve_file(file).await? {
                        Some(response) => return Ok(Some(response)),
                        None => not_found = true,
                    },
                }
            }

            if not_found && !self.fall_through {
                return Ok(Some(
                    Response::new(StatusCode::NOT_FOUND).body("file not found"),
                ));
            }
            next.pass(request).await
        })
    }
}
