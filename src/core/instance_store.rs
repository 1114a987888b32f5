use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::core::error::{CoreError, Result};
use crate::core::instance::{validate_instance_name, InstanceEdit, InstanceRecord};
use crate::core::launcher::LauncherLayout;

/// Ordered registry of instance records backed by a single JSON document.
///
/// All mutation is expected to happen on the control thread; the store does no
/// locking of its own.
#[derive(Debug)]
pub struct InstanceStore {
    registry_file: PathBuf,
    instances_root: PathBuf,
    records: Vec<InstanceRecord>,
}

impl InstanceStore {
    /// Loads the registry, substituting an empty one when the file is missing
    /// or corrupt.
    pub fn load(layout: &LauncherLayout) -> Self {
        let records = match read_registry(&layout.registry_file) {
            Ok(records) => records,
            Err(error) => {
                warn!(%error, "starting with an empty instance registry");
                Vec::new()
            }
        };
        info!(count = records.len(), "instance registry loaded");
        Self {
            registry_file: layout.registry_file.clone(),
            instances_root: layout.instances.clone(),
            records,
        }
    }

    /// Rewrites the whole registry file.
    pub fn save(&self) -> Result<()> {
        let mut document = Map::new();
        for record in &self.records {
            let value = serde_json::to_value(record)
                .map_err(|error| std::io::Error::new(std::io::ErrorKind::InvalidData, error))?;
            document.insert(record.name.clone(), value);
        }
        if let Some(parent) = self.registry_file.parent() {
            fs::create_dir_all(parent)?;
        }
        let serialized = serde_json::to_string_pretty(&Value::Object(document))
            .map_err(|error| std::io::Error::new(std::io::ErrorKind::InvalidData, error))?;
        fs::write(&self.registry_file, serialized)?;
        debug!(path = %self.registry_file.display(), "instance registry saved");
        Ok(())
    }

    pub fn records(&self) -> &[InstanceRecord] {
        &self.records
    }

    pub fn names(&self) -> Vec<String> {
        self.records.iter().map(|record| record.name.clone()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&InstanceRecord> {
        self.records.iter().find(|record| record.name == name)
    }

    pub fn instance_dir(&self, name: &str) -> PathBuf {
        self.instances_root.join(name)
    }

    /// Explicit "new instance": duplicates are rejected.
    pub fn create(&mut self, record: InstanceRecord) -> Result<&InstanceRecord> {
        validate_instance_name(&record.name)?;
        if self.contains(&record.name) {
            return Err(CoreError::InstanceExists(record.name));
        }
        let mut record = record;
        record.normalize();
        info!(instance = %record.name, "instance created");
        self.records.push(record);
        self.save()?;
        Ok(&self.records[self.records.len() - 1])
    }

    /// Inserts or replaces a record, keeping the position of a replaced one.
    pub fn upsert(&mut self, record: InstanceRecord) -> Result<()> {
        validate_instance_name(&record.name)?;
        let mut record = record;
        record.normalize();
        match self.position(&record.name) {
            Some(index) => self.records[index] = record,
            None => self.records.push(record),
        }
        self.save()
    }

    /// Applies a settings edit in memory. Persisting is left to the caller
    /// (instance switch or launch).
    pub fn edit(&mut self, name: &str, edit: InstanceEdit) -> Result<&InstanceRecord> {
        let index = self
            .position(name)
            .ok_or_else(|| CoreError::InstanceNotFound(name.to_string()))?;
        self.records[index].apply(edit);
        Ok(&self.records[index])
    }

    /// Renames the record and moves its directory. Nothing changes when the
    /// directory move fails.
    pub fn rename(&mut self, old: &str, new: &str) -> Result<()> {
        validate_instance_name(new)?;
        let index = self
            .position(old)
            .ok_or_else(|| CoreError::InstanceNotFound(old.to_string()))?;
        if old == new {
            return Ok(());
        }
        let old_dir = self.instance_dir(old);
        let new_dir = self.instance_dir(new);
        if self.contains(new) || new_dir.exists() {
            return Err(CoreError::InstanceExists(new.to_string()));
        }

        if old_dir.exists() {
            fs::rename(&old_dir, &new_dir)?;
        }

        let record = &mut self.records[index];
        record.name = new.to_string();
        if let Some(icon) = record.icon_path.take() {
            record.icon_path = Some(rebase_icon_path(icon, old, &old_dir, &new_dir, new));
        }
        info!(from = old, to = new, "instance renamed");
        self.save()
    }

    /// Removes the record and, best effort, its directory. Deleting a name
    /// that is already gone is a no-op.
    pub fn delete(&mut self, name: &str) -> Result<()> {
        let Some(index) = self.position(name) else {
            debug!(instance = name, "delete of unknown instance ignored");
            return Ok(());
        };
        self.records.remove(index);

        let dir = self.instance_dir(name);
        if dir.exists() {
            if let Err(error) = fs::remove_dir_all(&dir) {
                warn!(instance = name, %error, "could not remove instance directory");
            }
        }
        info!(instance = name, "instance deleted");
        self.save()
    }

    /// Moves an instance to `index` in the presentation order.
    pub fn move_instance(&mut self, name: &str, index: usize) -> Result<()> {
        let from = self
            .position(name)
            .ok_or_else(|| CoreError::InstanceNotFound(name.to_string()))?;
        let record = self.records.remove(from);
        let to = index.min(self.records.len());
        self.records.insert(to, record);
        self.save()
    }

    /// The `mods/` directory is only created when something asks for it.
    pub fn ensure_mods_dir(&self, name: &str) -> Result<PathBuf> {
        if !self.contains(name) {
            return Err(CoreError::InstanceNotFound(name.to_string()));
        }
        let mods = self.instance_dir(name).join("mods");
        fs::create_dir_all(&mods)?;
        Ok(mods)
    }

    /// Copies a user-supplied image into the instance directory and records
    /// it relative to that directory.
    pub fn import_icon(&mut self, name: &str, image: &Path) -> Result<()> {
        let index = self
            .position(name)
            .ok_or_else(|| CoreError::InstanceNotFound(name.to_string()))?;
        let extension = image
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("png")
            .to_ascii_lowercase();
        let file_name = format!("icon.{extension}");
        let dir = self.instance_dir(name);
        fs::create_dir_all(&dir)?;
        fs::copy(image, dir.join(&file_name))?;
        self.records[index].icon_path = Some(PathBuf::from(file_name));
        self.save()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.records.iter().position(|record| record.name == name)
    }
}

fn read_registry(path: &Path) -> Result<Vec<InstanceRecord>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(error) => return Err(CoreError::ConfigCorrupt(error.to_string())),
    };
    let document: Map<String, Value> =
        serde_json::from_str(&raw).map_err(|error| CoreError::ConfigCorrupt(error.to_string()))?;

    let mut records = Vec::with_capacity(document.len());
    for (name, value) in document {
        match serde_json::from_value::<InstanceRecord>(value) {
            Ok(mut record) if !name.trim().is_empty() => {
                record.name = name;
                record.normalize();
                records.push(record);
            }
            Ok(_) => warn!("skipping registry entry with an empty name"),
            Err(error) => warn!(instance = %name, %error, "skipping unreadable registry entry"),
        }
    }
    Ok(records)
}

fn rebase_icon_path(icon: PathBuf, old: &str, old_dir: &Path, new_dir: &Path, new: &str) -> PathBuf {
    if let Ok(rest) = icon.strip_prefix(old_dir) {
        return new_dir.join(rest);
    }
    if let Ok(rest) = icon.strip_prefix(old) {
        return Path::new(new).join(rest);
    }
    icon
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::instance::{LoaderKind, MAX_RAM_GIB, MIN_RAM_GIB};

    fn store_in(dir: &Path) -> (LauncherLayout, InstanceStore) {
        let layout = LauncherLayout::from_root(dir);
        layout.ensure().unwrap();
        let store = InstanceStore::load(&layout);
        (layout, store)
    }

    #[test]
    fn missing_registry_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let (_, store) = store_in(dir.path());
        assert!(store.records().is_empty());
    }

    #[test]
    fn corrupt_registry_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let layout = LauncherLayout::from_root(dir.path());
        fs::write(&layout.registry_file, "{\"A\": {\"username\": ").unwrap();
        let store = InstanceStore::load(&layout);
        assert!(store.records().is_empty());
    }

    #[test]
    fn save_and_load_preserves_order_and_fields() {
        let dir = tempfile::tempdir().unwrap();
        let (layout, mut store) = store_in(dir.path());
        store.create(InstanceRecord::new("Zeta", "Steve", "1.20.1")).unwrap();
        let mut alpha = InstanceRecord::new("Alpha", "Alex", "1.21.1");
        alpha.loader = LoaderKind::Quilt;
        alpha.set_ram_gib(8);
        store.create(alpha).unwrap();

        let reloaded = InstanceStore::load(&layout);
        assert_eq!(reloaded.names(), vec!["Zeta", "Alpha"]);
        let alpha = reloaded.get("Alpha").unwrap();
        assert_eq!(alpha.loader, LoaderKind::Quilt);
        assert_eq!(alpha.ram_gib(), 8);
        assert_eq!(alpha.username, "Alex");
    }

    #[test]
    fn reads_registry_written_without_newer_fields() {
        let dir = tempfile::tempdir().unwrap();
        let layout = LauncherLayout::from_root(dir.path());
        fs::write(
            &layout.registry_file,
            r#"{"Old": {"username": "Steve", "version": "1.20.1", "loader": "Fabric", "loader_version": "latest"},
                "Huge": {"version": "1.21.1", "ram": 640}}"#,
        )
        .unwrap();
        let store = InstanceStore::load(&layout);
        let old = store.get("Old").unwrap();
        assert_eq!(old.loader, LoaderKind::Fabric);
        assert_eq!(old.ram_gib(), 4);
        assert_eq!(store.get("Huge").unwrap().ram_gib(), MAX_RAM_GIB);
    }

    #[test]
    fn create_rejects_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let (_, mut store) = store_in(dir.path());
        store.create(InstanceRecord::new("A", "", "1.20.1")).unwrap();
        let result = store.create(InstanceRecord::new("A", "", "1.21.1"));
        assert!(matches!(result, Err(CoreError::InstanceExists(_))));
        assert_eq!(store.get("A").unwrap().version, "1.20.1");
    }

    #[test]
    fn edit_clamps_ram() {
        let dir = tempfile::tempdir().unwrap();
        let (_, mut store) = store_in(dir.path());
        store.create(InstanceRecord::new("A", "", "1.20.1")).unwrap();
        let edited = store
            .edit("A", InstanceEdit { ram_gib: Some(-3), ..InstanceEdit::default() })
            .unwrap();
        assert_eq!(edited.ram_gib(), MIN_RAM_GIB);
    }

    #[test]
    fn rename_moves_record_directory_and_icon() {
        let dir = tempfile::tempdir().unwrap();
        let (layout, mut store) = store_in(dir.path());
        let mut record = InstanceRecord::new("A", "Steve", "1.20.1");
        record.set_ram_gib(6);
        record.icon_path = Some(layout.instance_dir("A").join("icon.png"));
        store.create(record).unwrap();
        fs::create_dir_all(layout.instance_dir("A").join("config")).unwrap();
        fs::write(layout.instance_dir("A").join("icon.png"), b"png").unwrap();

        store.rename("A", "B").unwrap();

        assert!(!store.contains("A"));
        let renamed = store.get("B").unwrap();
        assert_eq!(renamed.username, "Steve");
        assert_eq!(renamed.ram_gib(), 6);
        assert_eq!(
            renamed.icon_path.as_deref(),
            Some(layout.instance_dir("B").join("icon.png").as_path())
        );
        assert!(!layout.instance_dir("A").exists());
        assert!(layout.instance_dir("B").join("config").is_dir());

        let reloaded = InstanceStore::load(&layout);
        assert_eq!(reloaded.names(), vec!["B"]);
    }

    #[test]
    fn rename_to_existing_name_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (layout, mut store) = store_in(dir.path());
        store.create(InstanceRecord::new("A", "", "1.20.1")).unwrap();
        store.create(InstanceRecord::new("B", "", "1.21.1")).unwrap();
        fs::create_dir_all(layout.instance_dir("A")).unwrap();

        let result = store.rename("A", "B");
        assert!(matches!(result, Err(CoreError::InstanceExists(_))));
        assert_eq!(store.get("A").unwrap().version, "1.20.1");
        assert_eq!(store.get("B").unwrap().version, "1.21.1");
        assert!(layout.instance_dir("A").is_dir());
    }

    #[test]
    fn delete_removes_record_and_directory_and_repeats_quietly() {
        let dir = tempfile::tempdir().unwrap();
        let (layout, mut store) = store_in(dir.path());
        store.create(InstanceRecord::new("A", "", "1.20.1")).unwrap();
        fs::create_dir_all(layout.instance_dir("A").join("mods")).unwrap();

        store.delete("A").unwrap();
        assert!(!store.contains("A"));
        assert!(!layout.instance_dir("A").exists());

        store.delete("A").unwrap();
        assert!(InstanceStore::load(&layout).records().is_empty());
    }

    #[test]
    fn move_instance_changes_persisted_order() {
        let dir = tempfile::tempdir().unwrap();
        let (layout, mut store) = store_in(dir.path());
        for name in ["A", "B", "C"] {
            store.create(InstanceRecord::new(name, "", "1.20.1")).unwrap();
        }
        store.move_instance("C", 0).unwrap();
        assert_eq!(InstanceStore::load(&layout).names(), vec!["C", "A", "B"]);
    }

    #[test]
    fn import_icon_stores_relative_path() {
        let dir = tempfile::tempdir().unwrap();
        let (layout, mut store) = store_in(dir.path());
        store.create(InstanceRecord::new("A", "", "1.20.1")).unwrap();
        let image = dir.path().join("logo.PNG");
        fs::write(&image, b"img").unwrap();

        store.import_icon("A", &image).unwrap();
        assert_eq!(store.get("A").unwrap().icon_path.as_deref(), Some(Path::new("icon.png")));
        assert!(layout.instance_dir("A").join("icon.png").is_file());
    }
}
