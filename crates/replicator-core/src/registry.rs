use replicator_platform::window::{EnumerateError, WindowEnumerator, WindowHandle};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum RegistryError {
    /// Zero or several visible windows carry the title.
    #[error("no unique visible window titled {title:?} ({matches} matches)")]
    AmbiguousOrMissingWindow { title: String, matches: usize },
    #[error(transparent)]
    Enumerate(#[from] EnumerateError),
}

/// Title-based lookup over the platform's visible top-level windows.
pub struct WindowRegistry {
    enumerator: Box<dyn WindowEnumerator>,
}

impl WindowRegistry {
    pub fn new(enumerator: Box<dyn WindowEnumerator>) -> Self {
        Self { enumerator }
    }

    /// Titles of all visible top-level windows, empty ones included, in
    /// enumeration order. A snapshot, not a live view.
    pub fn list_visible_windows(&self) -> Result<Vec<String>, RegistryError> {
        let windows = self.enumerator.visible_windows()?;
        Ok(windows.into_iter().map(|w| w.title).collect())
    }

    /// Re-enumerate and return the handle of the single window whose title
    /// equals `title` exactly.
    pub fn resolve_handle(&self, title: &str) -> Result<WindowHandle, RegistryError> {
        let matches: Vec<WindowHandle> = self
            .enumerator
            .visible_windows()?
            .into_iter()
            .filter(|w| w.title == title)
            .map(|w| w.handle)
            .collect();

        debug!("title {:?} matched handles {:?}", title, matches);

        match matches.as_slice() {
            [handle] => {
                info!("resolved window {:?} to handle {}", title, handle);
                Ok(*handle)
            }
            _ => Err(RegistryError::AmbiguousOrMissingWindow {
                title: title.to_string(),
                matches: matches.len(),
            }),
        }
    }
}
