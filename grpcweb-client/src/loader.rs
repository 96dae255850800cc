//! Compiling `.proto` sources into descriptor sets.
//!
//! Sources are read only through a [`FileAccessor`]; `google/protobuf/*`
//! imports fall back to the copies bundled with protox.

use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use prost_types::FileDescriptorSet;
use protox::file::{ChainFileResolver, File, FileResolver, GoogleFileResolver};

use crate::ClientError;
use crate::host::FileAccessor;

/// Resolves import names against a list of root directories.
struct AccessorResolver {
    accessor: Arc<dyn FileAccessor>,
    roots: Vec<PathBuf>,
}

impl FileResolver for AccessorResolver {
    fn resolve_path(&self, path: &Path) -> Option<String> {
        if path.is_relative() {
            return to_import_name(path);
        }
        self.roots
            .iter()
            .find_map(|root| path.strip_prefix(root).ok())
            .and_then(to_import_name)
    }

    fn open_file(&self, name: &str) -> Result<File, protox::Error> {
        for root in &self.roots {
            let path = root.join(name);
            match self.accessor.read(&path) {
                Ok(bytes) => {
                    let source = String::from_utf8(bytes).map_err(|_| {
                        protox::Error::new(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("{} is not valid UTF-8", path.display()),
                        ))
                    })?;
                    return File::from_source(name, &source);
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(protox::Error::new(io::Error::new(
                        e.kind(),
                        format!("{}: {}", path.display(), e),
                    )));
                }
            }
        }
        Err(protox::Error::file_not_found(name))
    }
}

/// Import names always use `/`, whatever the platform separator.
fn to_import_name(path: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            Component::CurDir => {}
            _ => return None,
        }
    }
    (!parts.is_empty()).then(|| parts.join("/"))
}

/// Resolve import paths: empty means the working directory, relative ones
/// are joined to it.
pub(crate) fn resolve_import_paths<P: AsRef<Path>>(working_dir: &Path, import_paths: &[P]) -> Vec<PathBuf> {
    if import_paths.is_empty() {
        return vec![working_dir.to_path_buf()];
    }
    import_paths
        .iter()
        .map(|p| {
            let p = p.as_ref();
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                working_dir.join(p)
            }
        })
        .collect()
}

/// Compile `filenames` and everything they import.
pub(crate) fn compile<P, F>(
    accessor: Arc<dyn FileAccessor>,
    working_dir: &Path,
    import_paths: &[P],
    filenames: &[F],
) -> Result<FileDescriptorSet, ClientError>
where
    P: AsRef<Path>,
    F: AsRef<Path>,
{
    let roots = resolve_import_paths(working_dir, import_paths);
    tracing::debug!(?roots, files = filenames.len(), "compiling proto sources");

    let mut resolver = ChainFileResolver::new();
    resolver.add(AccessorResolver { accessor, roots });
    resolver.add(GoogleFileResolver::new());

    let mut compiler = protox::Compiler::with_file_resolver(resolver);
    compiler.include_imports(true);
    compiler
        .open_files(filenames.iter().map(|f| f.as_ref()))
        .map_err(|e| ClientError::Parse(e.to_string()))?;

    Ok(compiler.file_descriptor_set())
}
