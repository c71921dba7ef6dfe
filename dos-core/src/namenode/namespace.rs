use crate::error::{DosError, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Object name -> ids of the data nodes holding a copy.
#[derive(Debug, Default, Clone)]
pub struct NamespaceDirectory {
    entries: BTreeMap<String, BTreeSet<String>>,
}

impl NamespaceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn exists(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn add(&mut self, name: &str) -> Result<()> {
        if self.exists(name) {
            return Err(DosError::ObjectAlreadyExists(name.to_string()));
        }
        self.entries.insert(name.to_string(), BTreeSet::new());
        Ok(())
    }

    pub fn delete(&mut self, name: &str) -> Result<()> {
        self.entries
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| DosError::ObjectNotFound(name.to_string()))
    }

    /// Returns false if `name` has no entry.
    pub fn add_holder(&mut self, name: &str, node_id: &str) -> bool {
        match self.entries.get_mut(name) {
            Some(holders) => {
                holders.insert(node_id.to_string());
                true
            }
            None => false,
        }
    }

    /// Add `node_id` as holder only when the entry exists with no holder.
    pub fn claim_unheld(&mut self, name: &str, node_id: &str) -> bool {
        match self.entries.get_mut(name) {
            Some(holders) if holders.is_empty() => {
                holders.insert(node_id.to_string());
                true
            }
            _ => false,
        }
    }

    /// Drop `node_id` from every entry.
    pub fn remove_holder(&mut self, node_id: &str) {
        for holders in self.entries.values_mut() {
            holders.remove(node_id);
        }
    }

    pub fn holders_of(&self, name: &str) -> Result<&BTreeSet<String>> {
        self.entries
            .get(name)
            .ok_or_else(|| DosError::ObjectNotFound(name.to_string()))
    }

    pub fn objects_held_by(&self, node_id: &str) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, holders)| holders.contains(node_id))
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Load a snapshot written by [`NamespaceDirectory::save`]. Only names
    /// are persisted; holders are rebuilt as nodes report in.
    pub fn load(path: &Path) -> Result<Self> {
        let mut directory = Self::new();
        if !path.exists() {
            return Ok(directory);
        }

        let content = std::fs::read_to_string(path)?;
        for line in content.lines() {
            let name = line.trim();
            if name.is_empty() || directory.exists(name) {
                continue;
            }
            directory.add(name)?;
        }
        tracing::info!(
            "loaded {} objects from namespace file {}",
            directory.len(),
            path.display()
        );
        Ok(directory)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut content = String::new();
        for name in self.names() {
            content.push_str(name);
            content.push('\n');
        }

        let staging = path.with_extension("tmp");
        std::fs::write(&staging, content)?;
        std::fs::rename(&staging, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_delete() {
        let mut namespace = NamespaceDirectory::new();
        namespace.add("a").unwrap();
        assert!(namespace.exists("a"));
        assert!(matches!(
            namespace.add("a"),
            Err(DosError::ObjectAlreadyExists(_))
        ));

        namespace.delete("a").unwrap();
        assert!(!namespace.exists("a"));
        assert!(matches!(
            namespace.delete("a"),
            Err(DosError::ObjectNotFound(_))
        ));
    }

    #[test]
    fn test_holders() {
        let mut namespace = NamespaceDirectory::new();
        namespace.add("a").unwrap();
        namespace.add("b").unwrap();
        assert!(namespace.add_holder("a", "n1"));
        assert!(namespace.add_holder("a", "n2"));
        assert!(namespace.add_holder("b", "n1"));
        assert!(!namespace.add_holder("missing", "n1"));

        assert_eq!(namespace.objects_held_by("n1"), vec!["a", "b"]);

        namespace.remove_holder("n1");
        let holders: Vec<_> = namespace.holders_of("a").unwrap().iter().cloned().collect();
        assert_eq!(holders, vec!["n2"]);
        assert!(namespace.holders_of("b").unwrap().is_empty());
        assert!(matches!(
            namespace.holders_of("missing"),
            Err(DosError::ObjectNotFound(_))
        ));
    }

    #[test]
    fn test_claim_unheld_skips_held_entries() {
        let mut namespace = NamespaceDirectory::new();
        namespace.add("held").unwrap();
        namespace.add("orphan").unwrap();
        namespace.add_holder("held", "n1");

        assert!(!namespace.claim_unheld("held", "n2"));
        assert!(namespace.claim_unheld("orphan", "n2"));
        assert!(!namespace.claim_unheld("orphan", "n3"));
        assert!(!namespace.claim_unheld("missing", "n2"));

        assert_eq!(namespace.objects_held_by("n2"), vec!["orphan".to_string()]);
        assert_eq!(namespace.holders_of("held").unwrap().len(), 1);
    }

    #[test]
    fn test_snapshot_round_trip_keeps_names_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("namespace.txt");

        let mut namespace = NamespaceDirectory::new();
        namespace.add("x").unwrap();
        namespace.add("y").unwrap();
        namespace.add_holder("x", "n1");
        namespace.save(&path).unwrap();

        let loaded = NamespaceDirectory::load(&path).unwrap();
        assert_eq!(loaded.names().collect::<Vec<_>>(), vec!["x", "y"]);
        assert!(loaded.holders_of("x").unwrap().is_empty());

        let missing = NamespaceDirectory::load(&dir.path().join("absent")).unwrap();
        assert!(missing.is_empty());
    }
}
