//! Fixtures for tests that need a stand-in interpreter.
//!
//! The fake interpreter understands `-m venv <path>` (creating a minimal
//! environment with its own `python` and `pip`) and otherwise runs its
//! arguments as a shell script, so app behaviour is scripted in `run.sh`.

use std::path::{Path, PathBuf};
use std::time::Duration;

const FAKE_PYTHON: &str = r#"#!/bin/sh
if [ "$1" = "-m" ] && [ "$2" = "venv" ]; then
    mkdir -p "$3/bin"
    cp "$0" "$3/bin/python"
    cat > "$3/bin/pip" <<'PIP'
#!/bin/sh
if [ "$2" = "--upgrade" ]; then
    exit 0
fi
if grep -q broken-package "$3"; then
    echo "ERROR: No matching distribution found for broken-package" >&2
    exit 1
fi
echo "$3" >> "$(dirname "$0")/../install.log"
PIP
    chmod +x "$3/bin/python" "$3/bin/pip"
    exit 0
fi
exec /bin/sh "$@"
"#;

pub fn write_script(dir: &Path, name: &str, content: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

pub fn fake_interpreter(dir: &Path) -> PathBuf {
    write_script(dir, "python3", FAKE_PYTHON)
}

/// One line per dependency installation run
pub fn read_install_log(env: &Path) -> Vec<String> {
    std::fs::read_to_string(env.join("install.log"))
        .map(|s| s.lines().map(str::to_string).collect())
        .unwrap_or_default()
}

/// App directory with a manifest, a `run.sh` body and optional requirements
pub fn write_app(root: &Path, name: &str, script: &str, requirements: Option<&str>) -> PathBuf {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("config.json"), format!(r#"{{"name": "{}"}}"#, name)).unwrap();
    std::fs::write(dir.join("run.sh"), script).unwrap();
    if let Some(req) = requirements {
        std::fs::write(dir.join("requirements.txt"), req).unwrap();
    }
    dir
}

pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    check()
}
