use chrono::Local;
use std::{fs, path::Path, sync::Arc};
use tracing::{info, warn};

/// HTML served to clients that are not on the allow-list.
#[derive(Clone, Debug)]
pub struct StaticPage {
    body: Arc<[u8]>,
}

impl StaticPage {
    /// Uses the file at `path` verbatim when it is readable, otherwise a
    /// generated page showing the server start time.
    pub fn load(path: Option<&Path>) -> Self {
        if let Some(path) = path.filter(|p| !p.as_os_str().is_empty()) {
            match fs::read(path) {
                Ok(body) => {
                    info!(path = %path.display(), bytes = body.len(), "Static page loaded");
                    return Self::from_bytes(body);
                }
                Err(e) => warn!(
                    path = %path.display(),
                    error = %e,
                    "Failed to read static page, using default"
                ),
            }
        }
        Self::default_page()
    }

    #[must_use]
    pub fn from_bytes(body: impl Into<Arc<[u8]>>) -> Self {
        Self { body: body.into() }
    }

    #[must_use]
    pub fn default_page() -> Self {
        Self::from_bytes(format!(
            "<html><head><title>Time Page</title></head>\
             <body style=\"font-size:12px;\">SERVER TIME: {}</body></html>",
            Local::now().format("%Y-%m-%d %H:%M:%S %:z")
        )
        .into_bytes())
    }

    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }
}
