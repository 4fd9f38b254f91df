use std::env;
use std::fmt;
use std::sync::Arc;

use crate::description::SignalDescription;

/// Hook applied to every locally produced offer or answer before it is used.
pub type AlterDescription = Arc<dyn Fn(&mut SignalDescription) + Send + Sync>;

const PRIORITY_ENV: &str = "SIGNALER_PRIORITY";

/// Per-signaler configuration.
///
/// The two signalers of a pairing must use opposite `priority` values.
#[derive(Clone, Default)]
pub struct SignalerConfig {
    pub priority: bool,
    pub alter_description: Option<AlterDescription>,
}

impl SignalerConfig {
    pub fn new(priority: bool) -> Self {
        Self {
            priority,
            alter_description: None,
        }
    }

    /// Reads the priority flag from `SIGNALER_PRIORITY`.
    pub fn from_env() -> Self {
        let priority = env::var(PRIORITY_ENV)
            .map(|value| is_truthy(&value))
            .unwrap_or(false);
        Self::new(priority)
    }

    pub fn with_alter_description(
        mut self,
        hook: impl Fn(&mut SignalDescription) + Send + Sync + 'static,
    ) -> Self {
        self.alter_description = Some(Arc::new(hook));
        self
    }

    pub(crate) fn alter(&self, desc: &mut SignalDescription) {
        if let Some(hook) = &self.alter_description {
            hook(desc);
        }
    }
}

impl fmt::Debug for SignalerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalerConfig")
            .field("priority", &self.priority)
            .field("alter_description", &self.alter_description.is_some())
            .finish()
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    #[test]
    fn default_has_no_priority_or_hook() {
        let config = SignalerConfig::default();
        assert!(!config.priority);
        assert!(config.alter_description.is_none());
    }

    #[test]
    fn hook_mutates_description() {
        let config = SignalerConfig::new(true)
            .with_alter_description(|desc| desc.sdp.push_str("a=x-altered\r\n"));
        let mut desc = SignalDescription::offer("v=0\r\n");
        config.alter(&mut desc);
        assert_eq!(desc.sdp, "v=0\r\na=x-altered\r\n");
        assert!(format!("{config:?}").contains("alter_description: true"));
    }

    #[test]
    fn priority_from_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let original = env::var(PRIORITY_ENV).ok();

        unsafe { env::set_var(PRIORITY_ENV, "yes") };
        assert!(SignalerConfig::from_env().priority);

        unsafe { env::set_var(PRIORITY_ENV, "0") };
        assert!(!SignalerConfig::from_env().priority);

        unsafe { env::remove_var(PRIORITY_ENV) };
        assert!(!SignalerConfig::from_env().priority);

        if let Some(value) = original {
            unsafe { env::set_var(PRIORITY_ENV, value) };
        }
    }
}
