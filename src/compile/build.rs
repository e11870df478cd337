//! External compiler invocation and the hash-addressed artifact cache.
//!
//! Cache layout: `{root}/{hash}/source.rs`, `{root}/{hash}/module.{so,dylib,dll}`
//! and `{root}/{hash}/meta.json`, where the hash covers the generated
//! source, the compiler flags, the platform and the compiler version.
//! Entries are immutable once published; the module file is moved into
//! place with a rename so concurrent writers can only race to publish
//! identical content.

use std::collections::hash_map::DefaultHasher;
use std::env;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::process::Command;

use rand::distr::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::codegen::GeneratedSource;
use crate::error::OdeJitError;
use crate::model::ODESystem;

/// Finds the rustc executable, checking common installation locations.
///
/// Processes launched outside a login shell (GUI applications, service
/// managers) may not inherit the user's PATH, so the standard rustup
/// location and a few platform-specific candidates are probed as well.
fn find_rustc() -> String {
    if let Ok(path) = env::var("ODEJIT_RUSTC") {
        return path;
    }

    if let Ok(output) = Command::new("rustc").arg("--version").output() {
        if output.status.success() {
            return "rustc".to_string();
        }
    }

    let home = env::var("HOME")
        .or_else(|_| env::var("USERPROFILE"))
        .unwrap_or_default();
    if !home.is_empty() {
        let standard_path = PathBuf::from(&home)
            .join(".cargo")
            .join("bin")
            .join(rustc_exe_name());
        if standard_path.exists() {
            return standard_path.to_string_lossy().to_string();
        }
    }

    #[cfg(target_os = "macos")]
    {
        let candidates = ["/opt/homebrew/bin/rustc", "/usr/local/bin/rustc"];
        for candidate in &candidates {
            if PathBuf::from(candidate).exists() {
                return candidate.to_string();
            }
        }
    }

    #[cfg(target_os = "linux")]
    {
        let candidates = ["/usr/local/bin/rustc", "/usr/bin/rustc", "/snap/bin/rustc"];
        for candidate in &candidates {
            if PathBuf::from(candidate).exists() {
                return candidate.to_string();
            }
        }
    }

    // Fall back to "rustc" and let the invocation fail with a clear error.
    "rustc".to_string()
}

#[inline]
fn rustc_exe_name() -> &'static str {
    #[cfg(target_os = "windows")]
    {
        "rustc.exe"
    }
    #[cfg(not(target_os = "windows"))]
    {
        "rustc"
    }
}

/// File name of the compiled module on the current platform.
pub(crate) fn module_file_name() -> &'static str {
    if cfg!(target_os = "windows") {
        "module.dll"
    } else if cfg!(target_os = "macos") {
        "module.dylib"
    } else {
        "module.so"
    }
}

fn platform_descriptor() -> String {
    format!("{}-{}", env::consts::OS, env::consts::ARCH)
}

/// Provenance record stored next to each cached module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub compiler: String,
    pub compiler_version: String,
    pub opt_level: u8,
    pub extra_flags: Vec<String>,
    pub platform: String,
    pub dim: usize,
}

/// A published cache entry.
#[derive(Debug, Clone)]
pub struct CompiledArtifact {
    pub hash: String,
    pub dir: PathBuf,
    pub module_path: PathBuf,
    /// Whether an existing entry was reused instead of compiling.
    pub reused: bool,
}

impl CompiledArtifact {
    pub fn meta(&self) -> Result<ArtifactMeta, OdeJitError> {
        let text = fs::read_to_string(self.dir.join("meta.json"))?;
        serde_json::from_str(&text).map_err(|e| OdeJitError::Internal(e.to_string()))
    }
}

/// On-disk artifact cache plus the compiler it feeds.
#[derive(Debug, Clone)]
pub struct ArtifactCache {
    root: PathBuf,
    rustc: String,
    rustc_version: String,
}

impl ArtifactCache {
    /// Create the cache directory and discover the compiler. Failure to
    /// run the compiler surfaces as an I/O error, which the pipeline may
    /// recover from with the fallback evaluator.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, OdeJitError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let rustc = find_rustc();
        let output = Command::new(&rustc).arg("--version").output()?;
        if !output.status.success() {
            return Err(std::io::Error::other(format!(
                "{rustc} --version exited with {}",
                output.status
            ))
            .into());
        }
        let rustc_version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        log::debug!("artifact cache at {} using {rustc} ({rustc_version})", root.display());
        Ok(Self {
            root,
            rustc,
            rustc_version,
        })
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    pub fn compiler_version(&self) -> &str {
        &self.rustc_version
    }

    /// Cache key over everything that influences the compiled module.
    pub fn content_hash(&self, generated: &GeneratedSource, system: &ODESystem) -> String {
        let mut hasher = DefaultHasher::new();
        generated.source.hash(&mut hasher);
        system.opt_level().hash(&mut hasher);
        for flag in system.extra_flags() {
            flag.hash(&mut hasher);
        }
        platform_descriptor().hash(&mut hasher);
        self.rustc_version.hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }

    /// Reuse the entry for this system if it exists, otherwise compile
    /// and publish it. Compilation is a blocking subprocess with captured
    /// diagnostics; a nonzero exit becomes [`OdeJitError::Compilation`]
    /// and leaves no partial entry behind.
    pub fn compile_or_reuse(
        &self,
        generated: &GeneratedSource,
        system: &ODESystem,
    ) -> Result<CompiledArtifact, OdeJitError> {
        let hash = self.content_hash(generated, system);
        let dir = self.root.join(&hash);
        let module_path = dir.join(module_file_name());
        if module_path.exists() {
            log::debug!("cache hit for {hash}");
            return Ok(CompiledArtifact {
                hash,
                dir,
                module_path,
                reused: true,
            });
        }

        log::info!(
            "cache miss for {hash}; compiling {} equations with {}",
            system.dim(),
            self.rustc
        );
        let random_suffix: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(8)
            .map(char::from)
            .collect();
        let scratch = self
            .root
            .join(format!(".build-{}-{random_suffix}", std::process::id()));
        fs::create_dir_all(&scratch)?;
        let result = self.build_in(&scratch, generated, system, &hash, &dir, &module_path);
        let _ = fs::remove_dir_all(&scratch);
        result
    }

    fn build_in(
        &self,
        scratch: &PathBuf,
        generated: &GeneratedSource,
        system: &ODESystem,
        hash: &str,
        dir: &PathBuf,
        module_path: &PathBuf,
    ) -> Result<CompiledArtifact, OdeJitError> {
        let source_path = scratch.join("source.rs");
        fs::write(&source_path, &generated.source)?;
        let built_path = scratch.join(module_file_name());

        let mut command = Command::new(&self.rustc);
        command
            .arg("--crate-type")
            .arg("cdylib")
            .arg("--edition")
            .arg("2021")
            .arg("-C")
            .arg(format!("opt-level={}", system.opt_level()));
        for flag in system.extra_flags() {
            command.arg(flag);
        }
        command.arg("-o").arg(&built_path).arg(&source_path);

        let output = command.output()?;
        if !output.status.success() {
            let mut diagnostics = String::from_utf8_lossy(&output.stderr).to_string();
            let stdout = String::from_utf8_lossy(&output.stdout);
            if !stdout.trim().is_empty() {
                diagnostics.push_str(&stdout);
            }
            return Err(OdeJitError::Compilation { diagnostics });
        }

        fs::create_dir_all(dir)?;
        fs::write(dir.join("source.rs"), &generated.source)?;
        let meta = ArtifactMeta {
            compiler: self.rustc.clone(),
            compiler_version: self.rustc_version.clone(),
            opt_level: system.opt_level(),
            extra_flags: system.extra_flags().to_vec(),
            platform: platform_descriptor(),
            dim: generated.dim,
        };
        let meta_text =
            serde_json::to_string_pretty(&meta).map_err(|e| OdeJitError::Internal(e.to_string()))?;
        fs::write(dir.join("meta.json"), meta_text)?;

        // Atomic publish: the entry is addressed by content, so if a
        // concurrent writer won the rename its module is identical and
        // this build is simply discarded.
        if let Err(e) = fs::rename(&built_path, module_path) {
            if !module_path.exists() {
                return Err(e.into());
            }
        }
        log::info!("published artifact {hash}");

        Ok(CompiledArtifact {
            hash: hash.to_string(),
            dir: dir.clone(),
            module_path: module_path.clone(),
            reused: false,
        })
    }
}
