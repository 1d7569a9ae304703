//! Resource limits for one top-level call.

/// Maximum number of instructions executed across all paths.
pub const DEFAULT_MAX_STEPS: usize = 100_000;
/// Maximum nesting of undecided branches.
pub const DEFAULT_MAX_FORK_DEPTH: usize = 32;
/// Maximum number of forks in one top-level call.
pub const DEFAULT_MAX_PATHS: usize = 4_096;
/// Maximum nesting of interpreted calls.
pub const DEFAULT_MAX_CALL_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub max_steps: usize,
    pub max_fork_depth: usize,
    pub max_paths: usize,
    pub max_call_depth: usize,
    /// Hash-cons every value written to the store.
    pub intern: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            max_fork_depth: DEFAULT_MAX_FORK_DEPTH,
            max_paths: DEFAULT_MAX_PATHS,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            intern: false,
        }
    }
}

impl Config {
    pub fn with_max_steps(mut self, n: usize) -> Self {
        self.max_steps = n;
        self
    }

    pub fn with_max_fork_depth(mut self, n: usize) -> Self {
        self.max_fork_depth = n;
        self
    }

    pub fn with_max_paths(mut self, n: usize) -> Self {
        self.max_paths = n;
        self
    }

    pub fn with_max_call_depth(mut self, n: usize) -> Self {
        self.max_call_depth = n;
        self
    }

    pub fn with_interning(mut self, on: bool) -> Self {
        self.intern = on;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_builders() {
        let c = Config::default();
        assert_eq!(c.max_steps, DEFAULT_MAX_STEPS);
        assert_eq!(c.max_paths, DEFAULT_MAX_PATHS);
        assert!(!c.intern);
        let c = c.with_max_fork_depth(4).with_max_call_depth(8).with_interning(true);
        assert_eq!(c.max_fork_depth, 4);
        assert_eq!(c.max_call_depth, 8);
        assert!(c.intern);
    }
}
