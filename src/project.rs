//! Project Management
//!
//! A project is a directory holding the object store plus a `Logs/` and a
//! `Runs/` folder. Every protocol stored in the project gets its own
//! working directory `Runs/<ClassName><id>`.

use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::config::EngineConfig;
use crate::error::ProtocolError;
use crate::mapper::{Criteria, Mapper, SqliteMapper};
use crate::object::{ClassKind, ClassRegistry, Node, ObjectId};
use crate::paths::{clean_path, make_path};
use crate::protocol::{Protocol, ProtocolKind, StepStatus};

/// A project directory and its open object store.
#[derive(Debug)]
pub struct Project {
    path: PathBuf,
    config: EngineConfig,
    mapper: SqliteMapper,
}

impl Project {
    /// Creates a new project, wiping any previous data in `path`.
    pub fn create<P: AsRef<Path>>(path: P, config: EngineConfig) -> Result<Self, ProtocolError> {
        let path = absolute(path.as_ref())?;
        make_path(&[&path])?;

        let layout = Layout::new(&path, &config);
        clean_path(&[&layout.db, &layout.logs, &layout.runs])?;

        let mut mapper = SqliteMapper::open(&layout.db, ClassRegistry::new())?;
        mapper.commit()?;
        make_path(&[&layout.logs, &layout.runs])?;

        info!("Created project: {}", path.display());
        Ok(Self {
            path,
            config,
            mapper,
        })
    }

    /// Opens an existing project.
    pub fn load<P: AsRef<Path>>(path: P, config: EngineConfig) -> Result<Self, ProtocolError> {
        let path = absolute(path.as_ref())?;
        let layout = Layout::new(&path, &config);
        if !layout.db.exists() {
            return Err(ProtocolError::ProjectNotFound(path.display().to_string()));
        }

        let mapper = SqliteMapper::open(&layout.db, ClassRegistry::new())?;
        make_path(&[&layout.logs, &layout.runs])?;

        debug!("Loaded project: {}", path.display());
        Ok(Self {
            path,
            config,
            mapper,
        })
    }

    /// Loads the project in `path`, creating it when it does not exist.
    pub fn open<P: AsRef<Path>>(path: P, config: EngineConfig) -> Result<Self, ProtocolError> {
        let path = path.as_ref();
        if Layout::new(path, &config).db.exists() {
            Self::load(path, config)
        } else {
            Self::create(path, config)
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn db_path(&self) -> PathBuf {
        Layout::new(&self.path, &self.config).db
    }

    pub fn logs_path(&self) -> PathBuf {
        Layout::new(&self.path, &self.config).logs
    }

    pub fn runs_path(&self) -> PathBuf {
        Layout::new(&self.path, &self.config).runs
    }

    pub fn mapper(&self) -> &SqliteMapper {
        &self.mapper
    }

    pub fn mapper_mut(&mut self) -> &mut SqliteMapper {
        &mut self.mapper
    }

    /// Makes a protocol class loadable from the store.
    pub fn register_kind<K: ProtocolKind>(&mut self, kind: &K) {
        let class_name = kind.class_name();
        if !self.mapper.registry().contains(class_name) {
            self.mapper
                .registry_mut()
                .register(class_name, ClassKind::Composite);
        }
    }

    /// Inserts a protocol and assigns its run name and working directory.
    pub fn store_protocol<K: ProtocolKind>(&mut self, protocol: &mut Protocol<K>) -> Result<ObjectId, ProtocolError> {
        self.register_kind(protocol.kind());
        let id = protocol.store(&mut self.mapper)?;

        let name = format!("{}{}", protocol.class_name(), id);
        protocol.set_working_dir(self.runs_path().join(&name));
        protocol.set_run_name(name);
        protocol.store(&mut self.mapper)?;
        Ok(id)
    }

    /// Stores a protocol if needed and runs it to completion or approval.
    pub fn launch_protocol<K: ProtocolKind>(&mut self, protocol: &mut Protocol<K>) -> Result<StepStatus, ProtocolError> {
        if protocol.id().is_none() {
            self.store_protocol(protocol)?;
        }
        self.run_protocol(protocol)
    }

    pub fn run_protocol<K: ProtocolKind>(&mut self, protocol: &mut Protocol<K>) -> Result<StepStatus, ProtocolError> {
        info!("Running {} in {}", protocol.run_name(), protocol.working_dir().display());
        protocol.run(&mut self.mapper)
    }

    /// Approves the waiting step of a protocol and resumes it.
    pub fn continue_protocol<K: ProtocolKind>(&mut self, protocol: &mut Protocol<K>) -> Result<StepStatus, ProtocolError> {
        protocol.continue_run(&mut self.mapper)
    }

    /// Loads a stored protocol of the given kind.
    pub fn load_protocol<K: ProtocolKind>(&mut self, kind: K, id: ObjectId) -> Result<Protocol<K>, ProtocolError> {
        self.register_kind(&kind);
        Protocol::load(kind, &self.mapper, id, self.config.clone())
    }

    /// Stored protocols of a class, oldest first.
    pub fn find_protocols(&self, class_name: &str) -> Result<Vec<Node>, ProtocolError> {
        if !self.mapper.registry().contains(class_name) {
            return Ok(Vec::new());
        }
        let found = self
            .mapper
            .select(&Criteria::new().class_name(class_name).roots())?;
        Ok(found)
    }

    /// Removes a protocol from the store and deletes its working directory.
    pub fn delete_protocol<K: ProtocolKind>(&mut self, protocol: &Protocol<K>) -> Result<(), ProtocolError> {
        self.mapper.delete(protocol.node())?;
        clean_path(&[protocol.working_dir()])?;
        self.mapper.commit()?;
        info!("Deleted protocol {}", protocol.run_name());
        Ok(())
    }

    /// Unstored copy of a protocol with the same parameter values.
    pub fn copy_protocol<K: ProtocolKind + Clone>(&self, protocol: &Protocol<K>) -> Protocol<K> {
        protocol.duplicate()
    }

    /// New unstored protocol using the project's configuration.
    pub fn new_protocol<K: ProtocolKind>(&self, kind: K) -> Protocol<K> {
        Protocol::new(kind, self.config.clone())
    }
}

/// Paths that make up a project directory.
struct Layout {
    db: PathBuf,
    logs: PathBuf,
    runs: PathBuf,
}

impl Layout {
    fn new(root: &Path, config: &EngineConfig) -> Self {
        Self {
            db: root.join(&config.database_name),
            logs: root.join(&config.logs_folder),
            runs: root.join(&config.runs_folder),
        }
    }
}

fn absolute(path: &Path) -> std::io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}
