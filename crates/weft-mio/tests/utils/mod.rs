use std::path::PathBuf;

use anyhow::Error;
use uuid::Uuid;

/// Temporary directory removed again on drop.
pub struct Fixture {
    pub path: PathBuf,
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

pub fn given_fixture(files: &[&str]) -> Result<Fixture, Error> {
    let path = std::env::temp_dir().join(format!("weft-test-{}", Uuid::new_v4()));
    std::fs::create_dir(&path)?;

    for file in files {
        std::fs::write(path.join(file), b"fixture")?;
    }

    Ok(Fixture { path })
}
