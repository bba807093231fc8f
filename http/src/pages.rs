//! preloaded html pages.
//!
//! All pages are read once at worker startup so the request path never
//! touches the filesystem for them. Test networks get a banner spliced
//! in at load time.

use std::fs;
use std::io;
use std::path::Path;

use bytes::Bytes;
use tracing::info;

use crate::chain::ChainMode;
use crate::router::Route;

/// Pages above this size indicate a packaging mistake, not content.
const MAX_PAGE_SIZE: u64 = 1024 * 1024;

const BANNER_PLACEHOLDER: &str = "<!-- NETWORK_BANNER -->";

pub const HTML_CONTENT_TYPE: &str = "text/html; charset=utf-8";

pub struct StaticPages {
    pub index: Bytes,
    pub broadcast: Bytes,
    pub result: Bytes,
    pub error: Bytes,
    pub docs: Bytes,
    pub status: Bytes,
    pub logos: Bytes,
}

#[derive(Debug)]
pub enum PageError {
    Io(String, io::Error),
    TooLarge(String, u64),
}

impl core::fmt::Display for PageError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            PageError::Io(name, e) => write!(f, "cannot load {name}: {e}"),
            PageError::TooLarge(name, size) => {
                write!(f, "{name} is {size} bytes, above the {MAX_PAGE_SIZE} byte page limit")
            }
        }
    }
}

impl std::error::Error for PageError {}

fn load_page(dir: &Path, name: &str, banner: Option<&str>) -> Result<Bytes, PageError> {
    let path = dir.join(name);
    let meta = fs::metadata(&path).map_err(|e| PageError::Io(name.to_owned(), e))?;
    if meta.len() > MAX_PAGE_SIZE {
        return Err(PageError::TooLarge(name.to_owned(), meta.len()));
    }

    let mut content = fs::read_to_string(&path).map_err(|e| PageError::Io(name.to_owned(), e))?;
    if let Some(banner) = banner {
        content = content.replace(BANNER_PLACEHOLDER, banner);
    }

    info!("loaded {} ({} bytes)", path.display(), content.len());
    Ok(Bytes::from(content))
}

impl StaticPages {
    pub fn load(dir: &Path, mode: ChainMode) -> Result<Self, PageError> {
        let banner = mode.banner_html();
        if banner.is_some() {
            info!("injecting {mode} banner into html pages");
        }

        Ok(Self {
            index: load_page(dir, "index.html", banner)?,
            broadcast: load_page(dir, "broadcast.html", banner)?,
            result: load_page(dir, "result.html", banner)?,
            error: load_page(dir, "error.html", banner)?,
            docs: load_page(dir, "docs.html", banner)?,
            status: load_page(dir, "status.html", banner)?,
            logos: load_page(dir, "logos.html", banner)?,
        })
    }

    /// Page body for a static route. `None` for routes with generated
    /// bodies.
    pub fn for_route(&self, route: Route) -> Option<&Bytes> {
        match route {
            Route::Home => Some(&self.index),
            Route::Broadcast => Some(&self.broadcast),
            Route::Result => Some(&self.result),
            Route::Error => Some(&self.error),
            Route::Docs => Some(&self.docs),
            Route::Status => Some(&self.status),
            Route::Logos => Some(&self.logos),
            _ => None,
        }
    }
}
