use std::path::{Path, PathBuf};

pub fn models_dir(home: &Path) -> PathBuf {
    home.join("models")
}

pub fn data_dir(home: &Path) -> PathBuf {
    home.join("data")
}

pub fn logs_dir(home: &Path) -> PathBuf {
    home.join("logs")
}

pub fn ensure_home_layout(home: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(home)?;
    std::fs::create_dir_all(models_dir(home))?;
    std::fs::create_dir_all(data_dir(home))?;
    std::fs::create_dir_all(logs_dir(home))?;
    Ok(())
}

const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

pub fn pretty_bytes(bytes: i64) -> String {
    let mut value = bytes.max(0) as f64;
    let mut unit = 0usize;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes.max(0), UNITS[unit])
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pretty_bytes_scales_units() {
        assert_eq!(pretty_bytes(0), "0 B");
        assert_eq!(pretty_bytes(512), "512 B");
        assert_eq!(pretty_bytes(2048), "2.00 KB");
        assert_eq!(pretty_bytes(5 * 1024 * 1024), "5.00 MB");
        assert_eq!(pretty_bytes(-3), "0 B");
    }

    #[test]
    fn home_layout_creates_subdirs() {
        let dir = tempfile::tempdir().unwrap();
        ensure_home_layout(dir.path()).unwrap();
        assert!(models_dir(dir.path()).is_dir());
        assert!(data_dir(dir.path()).is_dir());
        assert!(logs_dir(dir.path()).is_dir());
    }
}
