use std::time::{SystemTime, UNIX_EPOCH};

use image::RgbaImage;
use uuid::Uuid;

use crate::error::EngineResult;
use crate::io::{EncodedSurfaces, deserialize_project, encode_rgba_png_or_empty, serialize_project};
use crate::project::{LayerId, Project};

// ============================================================================
// CHECKPOINTS - named whole-project snapshots, most recent first
// ============================================================================

#[derive(Clone, Debug)]
pub struct Checkpoint {
    pub id: Uuid,
    pub label: String,
    /// Unix time in milliseconds.
    pub timestamp: u64,
    /// Serialized project plus surface pixels (see `io::serialize_project`).
    pub state: Vec<u8>,
    /// PNG thumbnail; empty when it could not be encoded.
    pub thumbnail: Vec<u8>,
}

impl Checkpoint {
    pub fn memory_size(&self) -> usize {
        self.state.len() + self.thumbnail.len() + self.label.len()
    }
}

/// In-memory checkpoint list. Unbounded; entries only change through
/// add / rename / delete.
#[derive(Default)]
pub struct CheckpointManager {
    checkpoints: Vec<Checkpoint>,
}

impl CheckpointManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot `project` with its encoded `surfaces` and prepend it.
    /// Serialization failure is an error; a missing thumbnail, or one that
    /// will not encode, is stored empty.
    pub fn add(
        &mut self,
        label: impl Into<String>,
        project: &Project,
        surfaces: &[(LayerId, Vec<u8>)],
        thumbnail: Option<&RgbaImage>,
    ) -> EngineResult<&Checkpoint> {
        let state = serialize_project(project, surfaces)?;
        let checkpoint = Checkpoint {
            id: Uuid::new_v4(),
            label: label.into(),
            timestamp: now_millis(),
            state,
            thumbnail: thumbnail.map(encode_rgba_png_or_empty).unwrap_or_default(),
        };
        crate::log_info!(
            "Checkpoint '{}' added ({} KB)",
            checkpoint.label,
            checkpoint.memory_size() / 1024
        );
        self.checkpoints.insert(0, checkpoint);
        Ok(&self.checkpoints[0])
    }

    /// Parse the stored project and surfaces for `id`. `None` for an
    /// unknown id or a snapshot that no longer parses.
    pub fn restore(&self, id: Uuid) -> Option<(Project, EncodedSurfaces)> {
        let checkpoint = self.get(id)?;
        match deserialize_project(&checkpoint.state) {
            Ok(restored) => Some(restored),
            Err(e) => {
                crate::log_warn!("Checkpoint '{}' is corrupt, restore ignored: {}", checkpoint.label, e);
                None
            }
        }
    }

    pub fn rename(&mut self, id: Uuid, label: impl Into<String>) -> bool {
        match self.checkpoints.iter_mut().find(|c| c.id == id) {
            Some(c) => {
                c.label = label.into();
                true
            }
            None => false,
        }
    }

    pub fn delete(&mut self, id: Uuid) -> bool {
        let before = self.checkpoints.len();
        self.checkpoints.retain(|c| c.id != id);
        self.checkpoints.len() != before
    }

    pub fn get(&self, id: Uuid) -> Option<&Checkpoint> {
        self.checkpoints.iter().find(|c| c.id == id)
    }

    /// Most recent first.
    pub fn list(&self) -> &[Checkpoint] {
        &self.checkpoints
    }

    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }

    /// Test hook: overwrite the stored state of a checkpoint.
    #[cfg(test)]
    pub(crate) fn corrupt(&mut self, id: Uuid, state: Vec<u8>) {
        if let Some(c) = self.checkpoints.iter_mut().find(|c| c.id == id) {
            c.state = state;
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::Layer;

    #[test]
    fn newest_checkpoint_comes_first() {
        let project = Project::new(8, 8);
        let mut mgr = CheckpointManager::new();
        let a = mgr.add("A", &project, &[], Some(&RgbaImage::new(4, 4))).unwrap().id;
        let b = mgr.add("B", &project, &[], Some(&RgbaImage::new(4, 4))).unwrap().id;
        let ids: Vec<Uuid> = mgr.list().iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![b, a]);
        assert!(!mgr.list()[0].thumbnail.is_empty());
        mgr.add("C", &project, &[], None).unwrap();
        assert!(mgr.list()[0].thumbnail.is_empty());
    }

    #[test]
    fn restore_returns_the_project_as_it_was() {
        let mut project = Project::new(8, 8);
        project.layers.push(Layer::new_raster("One"));
        let mut mgr = CheckpointManager::new();
        let pixels = vec![(project.layers[0].id, vec![9, 9, 9])];
        let id = mgr.add("A", &project, &pixels, Some(&RgbaImage::new(4, 4))).unwrap().id;
        let snapshot = project.clone();

        project.layers[0].name = "Changed".into();
        project.layers.push(Layer::new_raster("Two"));

        assert_eq!(mgr.restore(id), Some((snapshot, pixels)));
    }

    #[test]
    fn corrupt_or_unknown_restore_is_none() {
        let project = Project::new(8, 8);
        let mut mgr = CheckpointManager::new();
        let id = mgr.add("A", &project, &[], Some(&RgbaImage::new(4, 4))).unwrap().id;
        assert!(mgr.restore(Uuid::new_v4()).is_none());
        mgr.corrupt(id, vec![1, 2, 3]);
        assert!(mgr.restore(id).is_none());
    }

    #[test]
    fn rename_and_delete_by_id() {
        let project = Project::new(2, 2);
        let mut mgr = CheckpointManager::new();
        let id = mgr.add("first", &project, &[], Some(&RgbaImage::new(4, 4))).unwrap().id;
        assert!(mgr.rename(id, "renamed"));
        assert_eq!(mgr.get(id).unwrap().label, "renamed");
        assert!(!mgr.rename(Uuid::new_v4(), "x"));
        assert!(mgr.delete(id));
        assert!(!mgr.delete(id));
        assert!(mgr.is_empty());
    }
}
