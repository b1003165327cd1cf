//! Runtime configuration
//!
//! Sizing and tuning knobs for a runtime instance. Every field has a
//! default suitable for a small host; `from_env` layers `SPRIG_*`
//! environment overrides on top, warning and keeping the default for
//! values that do not parse.

use std::str::FromStr;

/// Sizing for one runtime instance.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Cons heap capacity in cells.
    pub heap_cells: usize,
    /// Byte memory capacity in words.
    pub mem_words: usize,
    /// Constant heap capacity in words.
    pub const_words: usize,
    /// GC mark stack capacity.
    pub gc_stack: usize,
    /// Defrag pool payload capacity in bytes (0 disables the pool).
    pub defrag_pool_bytes: usize,
    /// Evaluator steps per scheduler quantum.
    pub quantum: u32,
    /// Continuation stack initial capacity in words.
    pub kstack_initial: usize,
    /// Continuation stack hard cap in words.
    pub kstack_cap: usize,
    /// Mailbox bound per context.
    pub mailbox_cap: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            heap_cells: 2048,
            mem_words: 8192,
            const_words: 4096,
            gc_stack: 256,
            defrag_pool_bytes: 1024,
            quantum: 100,
            kstack_initial: 64,
            kstack_cap: 4096,
            mailbox_cap: 32,
        }
    }
}

/// Parse one environment override. Missing values keep the default;
/// invalid values warn and keep the default.
fn parse_env<T: FromStr + Copy>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(val) => match val.parse::<T>() {
            Ok(parsed) => parsed,
            Err(_) => {
                eprintln!(
                    "Warning: {}='{}' is not a valid value, using default",
                    name, val
                );
                default
            }
        },
        Err(_) => default,
    }
}

impl Config {
    /// Defaults with `SPRIG_*` environment overrides applied.
    pub fn from_env() -> Self {
        let d = Config::default();
        Config {
            heap_cells: parse_env("SPRIG_HEAP_CELLS", d.heap_cells).max(16),
            mem_words: parse_env("SPRIG_MEM_WORDS", d.mem_words).max(64),
            const_words: parse_env("SPRIG_CONST_WORDS", d.const_words),
            gc_stack: parse_env("SPRIG_GC_STACK", d.gc_stack).max(8),
            defrag_pool_bytes: parse_env("SPRIG_DEFRAG_POOL_BYTES", d.defrag_pool_bytes),
            quantum: parse_env("SPRIG_QUANTUM", d.quantum).max(1),
            kstack_initial: parse_env("SPRIG_KSTACK_INITIAL", d.kstack_initial).max(16),
            kstack_cap: parse_env("SPRIG_KSTACK_CAP", d.kstack_cap).max(64),
            mailbox_cap: parse_env("SPRIG_MAILBOX_CAP", d.mailbox_cap).max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults() {
        let c = Config::default();
        assert_eq!(c.quantum, 100);
        assert!(c.kstack_initial <= c.kstack_cap);
    }

    #[test]
    #[serial]
    fn test_env_override_valid() {
        unsafe { std::env::set_var("SPRIG_QUANTUM", "7") };
        let c = Config::from_env();
        assert_eq!(c.quantum, 7);
        unsafe { std::env::remove_var("SPRIG_QUANTUM") };
    }

    #[test]
    #[serial]
    fn test_env_override_invalid_keeps_default() {
        unsafe { std::env::set_var("SPRIG_QUANTUM", "not-a-number") };
        let c = Config::from_env();
        assert_eq!(c.quantum, Config::default().quantum);
        unsafe { std::env::remove_var("SPRIG_QUANTUM") };
    }

    #[test]
    #[serial]
    fn test_env_override_clamped() {
        unsafe { std::env::set_var("SPRIG_QUANTUM", "0") };
        let c = Config::from_env();
        assert_eq!(c.quantum, 1);
        unsafe { std::env::remove_var("SPRIG_QUANTUM") };
    }
}
