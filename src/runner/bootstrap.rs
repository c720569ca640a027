//! Work directory bootstrap
//!
//! Unpacks the user code package, writes the language entrypoint and
//! leaves the tree read-only.

use std::fs::{self, File, OpenOptions, Permissions};
use std::io::{self, Read};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};

use clap::ValueEnum;
use tracing::{debug, info};

/// Per-file extraction ceiling
pub const MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;

const JS_ENTRYPOINT: &[u8] = include_bytes!("assets/gram-start.js");
const JS_DEFAULT_FUNCTIONS: &[u8] = include_bytes!("assets/functions.js");
const PY_ENTRYPOINT: &[u8] = include_bytes!("assets/gram_start.py");
const PY_DEFAULT_FUNCTIONS: &[u8] = include_bytes!("assets/functions.py");

/// Bootstrap failures.
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    /// Bad flags
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),
    /// Archive entry would overwrite an entrypoint
    #[error("{0}: reserved path")]
    ReservedPath(String),
    /// Archive entry resolves outside the work dir
    #[error("{0}: path escapes work dir")]
    EscapesWorkDir(String),
    /// Decompression bomb guard
    #[error("{name}: file too large (>{limit} bytes, wrote {written} bytes)")]
    TooLarge {
        /// Entry name
        name: String,
        /// Ceiling
        limit: u64,
        /// Bytes written before the ceiling
        written: u64,
    },
    /// Filesystem failure
    #[error("{context}: {source}")]
    Io {
        /// What was being done
        context: String,
        /// Cause
        source: io::Error,
    },
    /// Unreadable archive
    #[error("open zip file: {0}")]
    Zip(#[from] zip::result::ZipError),
}

fn io_err(context: impl Into<String>) -> impl FnOnce(io::Error) -> BootstrapError {
    let context = context.into();
    move |source| BootstrapError::Io { context, source }
}

/// Language of the user code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Language {
    /// Node.js
    Javascript,
    /// Node.js with type stripping
    Typescript,
    /// CPython
    Python,
}

impl Language {
    /// Entrypoint file name inside the work dir
    #[must_use]
    pub fn entrypoint(self) -> &'static str {
        match self {
            Self::Javascript | Self::Typescript => "gram-start.js",
            Self::Python => "gram_start.py",
        }
    }

    /// User module file name
    #[must_use]
    pub fn functions_file(self) -> &'static str {
        match self {
            Self::Javascript | Self::Typescript => "functions.js",
            Self::Python => "functions.py",
        }
    }

    fn assets(self) -> (&'static [u8], &'static [u8]) {
        match self {
            Self::Javascript | Self::Typescript => (JS_ENTRYPOINT, JS_DEFAULT_FUNCTIONS),
            Self::Python => (PY_ENTRYPOINT, PY_DEFAULT_FUNCTIONS),
        }
    }

    /// Interpreter and leading arguments for an initialised work dir
    #[must_use]
    pub fn program(self, work_dir: &Path) -> Program {
        let entry = work_dir.join(self.entrypoint()).display().to_string();
        match self {
            Self::Javascript | Self::Typescript => Program {
                command: resolve_command("node"),
                args: vec!["--experimental-strip-types".into(), entry],
            },
            Self::Python => Program {
                command: resolve_command("python"),
                args: vec![entry],
            },
        }
    }
}

/// A command line without the per-call arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    /// Executable
    pub command: String,
    /// Arguments before `<fifo> <request> <type>`
    pub args: Vec<String>,
}

/// Find `name` on the runner's own `PATH`.
///
/// Children run with an empty environment, so the interpreter is resolved
/// once here rather than by the child's (absent) `PATH`.
#[must_use]
pub fn resolve_command(name: &str) -> String {
    let Some(paths) = std::env::var_os("PATH") else {
        return name.to_string();
    };
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| {
            fs::metadata(candidate).is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        })
        .map_or_else(|| name.to_string(), |p| p.display().to_string())
}

/// Inputs of `--init`.
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    /// Language of the package
    pub language: Language,
    /// Zip file
    pub code_path: PathBuf,
    /// Absolute destination
    pub work_dir: PathBuf,
}

/// Whether `path` is one of the entrypoints at the top of `work_dir`.
///
/// # Errors
///
/// Fails when `path` is not inside `work_dir`.
pub fn is_reserved_path(work_dir: &Path, path: &Path) -> Result<bool, BootstrapError> {
    let rel = path
        .strip_prefix(work_dir)
        .map_err(|_| BootstrapError::EscapesWorkDir(path.display().to_string()))?;
    let mut components = rel.components();
    let (Some(Component::Normal(name)), None) = (components.next(), components.next()) else {
        return Ok(false);
    };
    let name = name.to_string_lossy();
    Ok(["gram-start", "gram_start"]
        .iter()
        .any(|stem| name.as_ref() == *stem || name.starts_with(&format!("{stem}."))))
}

/// Check flags and create the work dir when missing.
///
/// # Errors
///
/// [`BootstrapError::InvalidArgs`] when the work dir is relative or not a
/// directory, or the code path is not a regular file.
pub fn validate(config: &BootstrapConfig) -> Result<(), BootstrapError> {
    if !config.work_dir.is_absolute() {
        return Err(BootstrapError::InvalidArgs("work dir path is not absolute".into()));
    }
    let code = fs::metadata(&config.code_path)
        .map_err(|e| BootstrapError::InvalidArgs(format!("stat: {}: {e}", config.code_path.display())))?;
    if !code.is_file() {
        return Err(BootstrapError::InvalidArgs(format!(
            "stat: {}: not a regular file",
            config.code_path.display()
        )));
    }
    match fs::metadata(&config.work_dir) {
        Ok(m) if m.is_dir() => Ok(()),
        Ok(_) => Err(BootstrapError::InvalidArgs(format!(
            "stat: {}: not a directory",
            config.work_dir.display()
        ))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            fs::create_dir_all(&config.work_dir).map_err(io_err(format!("create dir: {}", config.work_dir.display())))
        }
        Err(e) => Err(BootstrapError::InvalidArgs(format!("stat: {}: {e}", config.work_dir.display()))),
    }
}

/// Prepare the work dir and return the program that serves calls.
///
/// # Errors
///
/// Any [`BootstrapError`]; extraction stops at the first bad entry.
pub fn initialize(config: &BootstrapConfig) -> Result<Program, BootstrapError> {
    validate(config)?;
    let mut dirs = unzip_code(&config.code_path, &config.work_dir)?;
    write_entrypoint(&config.work_dir, config.language)?;

    // Deepest first so parents stay writable while children are sealed.
    dirs.sort_by_key(|d| std::cmp::Reverse(d.components().count()));
    dirs.push(config.work_dir.clone());
    for dir in &dirs {
        fs::set_permissions(dir, Permissions::from_mode(0o555))
            .map_err(io_err(format!("chmod {}", dir.display())))?;
    }

    info!(work_dir = %config.work_dir.display(), language = ?config.language, "work dir initialised");
    Ok(config.language.program(&config.work_dir))
}

/// Extract `zip_path` into `dest`, returning the directories created.
///
/// # Errors
///
/// Rejects entries escaping `dest`, entrypoint names and files larger than
/// [`MAX_FILE_SIZE`].
pub fn unzip_code(zip_path: &Path, dest: &Path) -> Result<Vec<PathBuf>, BootstrapError> {
    let file = File::open(zip_path).map_err(io_err(format!("{}: open zip file", zip_path.display())))?;
    let mut archive = zip::ZipArchive::new(file)?;
    let mut dirs = Vec::new();

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let name = entry.name().to_string();
        let rel = entry
            .enclosed_name()
            .map(PathBuf::from)
            .ok_or_else(|| BootstrapError::EscapesWorkDir(name.clone()))?;
        let path = dest.join(&rel);
        if is_reserved_path(dest, &path)? {
            return Err(BootstrapError::ReservedPath(name));
        }

        if entry.is_dir() {
            create_dirs(dest, &path, &mut dirs)?;
            continue;
        }
        if let Some(parent) = path.parent() {
            create_dirs(dest, parent, &mut dirs)?;
        }

        let mut target = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o444)
            .open(&path)
            .map_err(io_err(format!("{}: create target file", path.display())))?;
        let written = io::copy(&mut entry.by_ref().take(MAX_FILE_SIZE), &mut target)
            .map_err(io_err(format!("{name}: extract file")))?;
        if entry.size() > written {
            return Err(BootstrapError::TooLarge {
                name,
                limit: MAX_FILE_SIZE,
                written,
            });
        }
        debug!(file = %name, bytes = written, "extracted");
    }
    Ok(dirs)
}

fn create_dirs(root: &Path, dir: &Path, created: &mut Vec<PathBuf>) -> Result<(), BootstrapError> {
    let mut missing = Vec::new();
    let mut cur = dir;
    while cur != root && !cur.exists() {
        missing.push(cur.to_path_buf());
        match cur.parent() {
            Some(parent) => cur = parent,
            None => break,
        }
    }
    for d in missing.into_iter().rev() {
        fs::create_dir(&d).map_err(io_err(format!("{}: create directory", d.display())))?;
        created.push(d);
    }
    Ok(())
}

/// Write the entrypoint and, when absent or empty, a default user module.
///
/// # Errors
///
/// Fails when either file cannot be written.
pub fn write_entrypoint(work_dir: &Path, language: Language) -> Result<(), BootstrapError> {
    let (entrypoint, defaults) = language.assets();
    write_read_only(&work_dir.join(language.entrypoint()), entrypoint)?;

    let functions = work_dir.join(language.functions_file());
    match fs::metadata(&functions) {
        Ok(m) if m.len() > 0 => Ok(()),
        Ok(_) => write_read_only(&functions, defaults),
        Err(e) if e.kind() == io::ErrorKind::NotFound => write_read_only(&functions, defaults),
        Err(e) => Err(BootstrapError::Io {
            context: format!("stat {}", functions.display()),
            source: e,
        }),
    }
}

fn write_read_only(path: &Path, contents: &[u8]) -> Result<(), BootstrapError> {
    if path.exists() {
        fs::remove_file(path).map_err(io_err(format!("replace {}", path.display())))?;
    }
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o444)
        .open(path)
        .map_err(io_err(format!("write {}", path.display())))?;
    io::Write::write_all(&mut file, contents).map_err(io_err(format!("write {}", path.display())))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use zip::write::SimpleFileOptions;

    use super::*;

    fn package(dir: &Path, entries: &[(&str, &[u8])]) -> PathBuf {
        let path = dir.join("code.zip");
        let mut zip = zip::ZipWriter::new(File::create(&path).unwrap());
        for (name, data) in entries {
            if name.ends_with('/') {
                zip.add_directory(*name, SimpleFileOptions::default()).unwrap();
            } else {
                zip.start_file(*name, SimpleFileOptions::default()).unwrap();
                zip.write_all(data).unwrap();
            }
        }
        zip.finish().unwrap();
        path
    }

    fn unseal(dir: &Path) {
        for entry in walk(dir) {
            let _ = fs::set_permissions(&entry, Permissions::from_mode(0o755));
        }
    }

    fn walk(dir: &Path) -> Vec<PathBuf> {
        let mut out = vec![dir.to_path_buf()];
        if let Ok(entries) = fs::read_dir(dir) {
            for e in entries.flatten() {
                if e.path().is_dir() {
                    out.extend(walk(&e.path()));
                }
            }
        }
        out
    }

    // ========================================================================
    // Reserved paths
    // ========================================================================

    #[test]
    fn entrypoints_at_top_level_are_reserved() {
        let wd = Path::new("/srv/app");
        assert!(is_reserved_path(wd, Path::new("/srv/app/gram-start.js")).unwrap());
        assert!(is_reserved_path(wd, Path::new("/srv/app/gram_start.py")).unwrap());
        assert!(is_reserved_path(wd, Path::new("/srv/app/gram-start")).unwrap());
        assert!(!is_reserved_path(wd, Path::new("/srv/app/lib/gram-start.js")).unwrap());
        assert!(!is_reserved_path(wd, Path::new("/srv/app/gram-starter.js")).unwrap());
        assert!(!is_reserved_path(wd, Path::new("/srv/app/functions.js")).unwrap());
        assert!(is_reserved_path(wd, Path::new("/etc/passwd")).is_err());
    }

    // ========================================================================
    // Extraction
    // ========================================================================

    #[test]
    fn reserved_entry_aborts_extraction() {
        let tmp = tempfile::tempdir().unwrap();
        let wd = tmp.path().join("app");
        fs::create_dir(&wd).unwrap();
        let zip = package(tmp.path(), &[("gram-start.js", b"evil")]);
        let err = unzip_code(&zip, &wd).unwrap_err();
        assert!(err.to_string().contains("reserved path"), "{err}");
        assert!(!wd.join("gram-start.js").exists());
    }

    #[test]
    fn traversal_entry_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let wd = tmp.path().join("app");
        fs::create_dir(&wd).unwrap();
        let zip = package(tmp.path(), &[("../escape.txt", b"x")]);
        assert!(matches!(unzip_code(&zip, &wd), Err(BootstrapError::EscapesWorkDir(_))));
        assert!(!tmp.path().join("escape.txt").exists());
    }

    #[test]
    fn oversized_entry_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let wd = tmp.path().join("app");
        fs::create_dir(&wd).unwrap();
        let big = vec![0u8; usize::try_from(MAX_FILE_SIZE).unwrap() + 1];
        let zip = package(tmp.path(), &[("bomb.bin", &big)]);
        let err = unzip_code(&zip, &wd).unwrap_err();
        assert!(matches!(err, BootstrapError::TooLarge { written, .. } if written == MAX_FILE_SIZE));
    }

    #[test]
    fn init_extracts_and_seals() {
        let tmp = tempfile::tempdir().unwrap();
        let wd = tmp.path().join("app");
        let zip = package(
            tmp.path(),
            &[
                ("lib/", b""),
                ("lib/util.js", b"export const x = 1;"),
                ("functions.js", b"export async function handleToolCall() {}"),
            ],
        );
        let program = initialize(&BootstrapConfig {
            language: Language::Javascript,
            code_path: zip,
            work_dir: wd.clone(),
        })
        .unwrap();

        assert_eq!(program.args[0], "--experimental-strip-types");
        assert!(program.args[1].ends_with("gram-start.js"));
        assert_eq!(fs::read(wd.join("gram-start.js")).unwrap(), JS_ENTRYPOINT);
        assert_eq!(
            fs::read_to_string(wd.join("functions.js")).unwrap(),
            "export async function handleToolCall() {}"
        );
        let mode = |p: &Path| fs::metadata(p).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode(&wd), 0o555);
        assert_eq!(mode(&wd.join("lib")), 0o555);
        assert_eq!(mode(&wd.join("lib/util.js")), 0o444);
        assert_eq!(mode(&wd.join("gram-start.js")), 0o444);
        unseal(&wd);
    }

    #[test]
    fn default_module_written_when_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let wd = tmp.path().join("app");
        let zip = package(tmp.path(), &[("README.md", b"hi")]);
        initialize(&BootstrapConfig {
            language: Language::Python,
            code_path: zip,
            work_dir: wd.clone(),
        })
        .unwrap();
        assert_eq!(fs::read(wd.join("functions.py")).unwrap(), PY_DEFAULT_FUNCTIONS);
        assert_eq!(fs::read(wd.join("gram_start.py")).unwrap(), PY_ENTRYPOINT);
        unseal(&wd);
    }

    #[test]
    fn relative_work_dir_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let zip = package(tmp.path(), &[("a.js", b"")]);
        let err = validate(&BootstrapConfig {
            language: Language::Javascript,
            code_path: zip,
            work_dir: "relative/app".into(),
        })
        .unwrap_err();
        assert!(matches!(err, BootstrapError::InvalidArgs(_)));
    }

    #[test]
    fn code_path_must_be_a_file() {
        let tmp = tempfile::tempdir().unwrap();
        let err = validate(&BootstrapConfig {
            language: Language::Javascript,
            code_path: tmp.path().to_path_buf(),
            work_dir: tmp.path().join("app"),
        })
        .unwrap_err();
        assert!(err.to_string().contains("not a regular file"));
    }
}
