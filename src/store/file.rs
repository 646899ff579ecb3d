use crate::core::{Datastore, DbError, Result};
use crate::schema::ModuleSchema;
use crate::store::layout::RepoLayout;
use crate::store::xml;
use crate::tree::node::DataTree;
use crate::validate;
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::debug;

/// One loaded (module, datastore) tree with its freshness metadata.
#[derive(Debug, Clone)]
pub struct DataInfo {
    pub schema: Arc<ModuleSchema>,
    pub tree: DataTree,
    pub modified: bool,
    /// When this copy was loaded; compared against file mtime and the
    /// engine's last commit time for the optimized-commit predicate.
    pub loaded_at: SystemTime,
    /// Mtime of the backing file at load, None when the file did not exist.
    pub file_mtime: Option<SystemTime>,
    /// Candidate copies start as untouched aliases of running.
    pub read_only_alias: bool,
}

impl DataInfo {
    pub fn mark_modified(&mut self) {
        self.modified = true;
        self.read_only_alias = false;
    }
}

/// Load a (module, datastore) tree from disk.
///
/// A missing file is not an error: the result is an empty tree with defaults
/// materialized. The file mtime is captured before parsing so a concurrent
/// writer can only make the copy look older, never newer.
pub fn load(
    layout: &RepoLayout,
    schema: &Arc<ModuleSchema>,
    datastore: Datastore,
) -> Result<DataInfo> {
    let path = layout.data_file(&schema.name, datastore);
    let (mut tree, file_mtime) = match std::fs::metadata(&path) {
        Ok(metadata) => {
            let mtime = metadata.modified().ok();
            let bytes = std::fs::read(&path)?;
            let tree = xml::parse_tree(&bytes, schema, &schema.name)?;
            let errors = validate::validate_tree(schema, &tree);
            if !errors.is_empty() {
                return Err(DbError::ValidationFailed(errors));
            }
            (tree, mtime)
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            (DataTree::new(schema.name.clone()), None)
        }
        Err(err) => return Err(err.into()),
    };

    validate::materialize_defaults(schema, &mut tree);
    Ok(DataInfo {
        schema: Arc::clone(schema),
        tree,
        modified: false,
        loaded_at: SystemTime::now(),
        file_mtime,
        read_only_alias: false,
    })
}

/// Persist a post-commit tree: serialize first, then truncate, write, fsync.
///
/// The caller holds the file write lock; the file is never truncated before
/// the serialized bytes are ready, so a write error leaves either the old or
/// the new content observable, not a torn middle.
pub fn write(
    layout: &RepoLayout,
    schema: &ModuleSchema,
    datastore: Datastore,
    tree: &DataTree,
) -> Result<SystemTime> {
    let bytes = xml::serialize_tree(tree, schema, false)?;
    let path = layout.data_file(&schema.name, datastore);

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)?;
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&bytes)?;
    file.sync_all()?;
    debug!(module = %schema.name, %datastore, bytes = bytes.len(), "data file written");

    let mtime = file.metadata()?.modified()?;
    Ok(mtime)
}

/// Current mtime of a data file, None when it does not exist.
pub fn file_mtime(
    layout: &RepoLayout,
    module: &str,
    datastore: Datastore,
) -> Result<Option<SystemTime>> {
    match std::fs::metadata(layout.data_file(module, datastore)) {
        Ok(metadata) => Ok(Some(metadata.modified()?)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}
