use std::time::Duration;

/// Engine configuration.
///
/// Passed to [`Engine::new`](crate::Engine::new); there is no process-wide default engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Return disposed nodes to per-type free lists instead of freeing them.
    pub pooling: bool,
    /// Upper bound on the number of idle objects kept per pooled type.
    pub max_pooled: usize,
    /// How long a blocking wait spins on the waiter status before parking on its monitor.
    pub spin_duration: Duration,
}

impl Config {
    /// A configuration with pooling turned off, every node is freshly allocated.
    pub fn unpooled() -> Self {
        Self {
            pooling: false,
            ..Self::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pooling: true,
            max_pooled: 1024,
            spin_duration: Duration::from_micros(50),
        }
    }
}
