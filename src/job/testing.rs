//! Fake curl/tar/git/make scripts for driving real builds in tests.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use super::pipeline::PipelineSettings;
use crate::config::Toolchain;

pub const SAMPLE_DUMP: &str = "nginx version: nginx/1.24.0
built by gcc 12.2.0 (Debian 12.2.0-14)
built with OpenSSL 3.0.11 19 Sep 2023
TLS SNI support enabled
configure arguments: --prefix=/etc/nginx --with-http_ssl_module --with-cc-opt='-g -O2' --add-module=/opt/old
";

const CURL: &str = r#"#!/bin/sh
out=""
while [ $# -gt 0 ]; do
  case "$1" in
    -o) out="$2"; shift 2 ;;
    -*) shift ;;
    *) echo "fetching $1"; shift ;;
  esac
done
echo "fake tarball" > "$out"
"#;

const FAILING_CURL: &str = r#"#!/bin/sh
echo "curl: (22) The requested URL returned error: 404" >&2
exit 22
"#;

// Unpacks into nginx-<version>/ with a configure that records its arguments.
const TAR: &str = r#"#!/bin/sh
name=$(basename "$2" .tar.gz)
mkdir -p "$name/objs"
cat > "$name/configure" <<'EOF'
#!/bin/sh
printf '%s\n' "$@" > configure.args
echo "checking for OS"
echo "creating objs/Makefile"
EOF
chmod +x "$name/configure"
echo "extracted $name"
"#;

const GIT: &str = r#"#!/bin/sh
for last; do :; done
mkdir -p "$last"
echo "Cloning into '$last'..."
"#;

const MAKE: &str = r#"#!/bin/sh
echo "make $*"
echo "cc -c src/core/nginx.c" >&2
echo "fake nginx binary" > objs/nginx
"#;

const HANGING_MAKE: &str = r#"#!/bin/sh
echo "make $*"
sleep 30
"#;

pub struct FakeToolchain {
    dir: TempDir,
    toolchain: Toolchain,
}

impl FakeToolchain {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("create temp dir");
        std::fs::create_dir_all(dir.path().join("bin")).expect("create bin dir");
        let toolchain = Toolchain {
            curl: install(dir.path(), "curl", CURL),
            tar: install(dir.path(), "tar", TAR),
            git: install(dir.path(), "git", GIT),
            make: install(dir.path(), "make", MAKE),
        };
        Self { dir, toolchain }
    }

    pub fn with_failing_curl(mut self) -> Self {
        self.toolchain.curl = install(self.dir.path(), "curl-fail", FAILING_CURL);
        self
    }

    pub fn with_hanging_make(mut self) -> Self {
        self.toolchain.make = install(self.dir.path(), "make-hang", HANGING_MAKE);
        self
    }

    pub fn work_root(&self) -> PathBuf {
        self.dir.path().join("work")
    }

    pub fn modules_root(&self) -> PathBuf {
        self.dir.path().join("modules")
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn settings(&self) -> PipelineSettings {
        PipelineSettings {
            work_root: self.work_root(),
            modules_root: self.modules_root(),
            source_url: "https://nginx.example.test/download/".to_string(),
            toolchain: self.toolchain.clone(),
        }
    }
}

fn install(root: &Path, name: &str, body: &str) -> String {
    let path = root.join("bin").join(name);
    std::fs::write(&path, body).expect("write fake tool");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("chmod fake tool");
    path.display().to_string()
}
