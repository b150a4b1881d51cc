#![allow(dead_code)]

use mdbxkv::{Environment, EnvFlags};
use tempfile::TempDir;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// Common test setup
pub fn setup_test_env() -> (TempDir, Environment) {
    setup_with(EnvFlags::empty(), |_| {})
}

/// Open an environment in a fresh directory after `tune` adjusted it
pub fn setup_with<F>(flags: EnvFlags, tune: F) -> (TempDir, Environment)
where
    F: FnOnce(&mut Environment),
{
    init_logging();
    let temp_dir = TempDir::new().unwrap();
    let mut env = Environment::new().unwrap();
    tune(&mut env);
    env.open(temp_dir.path(), flags, 0o644).unwrap();
    (temp_dir, env)
}

/// Reopen the environment stored in `dir`
pub fn reopen<F>(dir: &TempDir, flags: EnvFlags, tune: F) -> Environment
where
    F: FnOnce(&mut Environment),
{
    let mut env = Environment::new().unwrap();
    tune(&mut env);
    env.open(dir.path(), flags, 0o644).unwrap();
    env
}

pub fn key(i: usize) -> Vec<u8> {
    format!("key_{:06}", i).into_bytes()
}

pub fn value(i: usize) -> Vec<u8> {
    format!("value_{}", i).into_bytes()
}
