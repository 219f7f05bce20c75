//! Process-wide facade.
//!
//! Applications that want a single shared [`KvKeeper`] install one here at
//! startup. Libraries should take a `KvKeeper` by value instead.

use std::sync::OnceLock;

use tracing::debug;

use crate::error::{KeeperError, KeeperResult};
use crate::keeper::KvKeeper;

static GLOBAL: OnceLock<KvKeeper> = OnceLock::new();

/// Install `keeper` as the process-wide facade.
///
/// # Errors
///
/// Returns a validation error if a facade is already installed; the
/// installed facade is left untouched.
pub fn install(keeper: KvKeeper) -> KeeperResult<&'static KvKeeper> {
    let mut installed = false;
    let current = GLOBAL.get_or_init(|| {
        installed = true;
        keeper
    });
    if installed {
        debug!("global storage facade installed");
        Ok(current)
    } else {
        Err(KeeperError::Validation(
            "A global storage facade is already installed".into(),
        ))
    }
}

/// The process-wide facade, if one was installed.
#[must_use]
pub fn get() -> Option<&'static KvKeeper> {
    GLOBAL.get()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostEnvironment;

    // The global is process-wide, so every assertion about it lives in one
    // test.
    #[tokio::test]
    async fn test_install_once() {
        let first = KvKeeper::new(HostEnvironment::in_memory());
        let installed = install(first).unwrap();
        installed.set_item("k", "v").await.unwrap();

        let second = KvKeeper::new(HostEnvironment::new());
        assert!(matches!(install(second), Err(KeeperError::Validation(_))));

        let current = get().unwrap();
        assert_eq!(current.get_item("k").await.unwrap().as_deref(), Some("v"));
    }
}
