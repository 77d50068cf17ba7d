use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{QueueError, QueueResult};
use crate::project::{Project, RenderModes, SettingField};

/// Ordered list of projects plus the queue-wide render modes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RenderQueue {
    #[serde(default)]
    projects: Vec<Project>,
    #[serde(default)]
    pub modes: RenderModes,
}

impl RenderQueue {
    pub fn new(projects: Vec<Project>) -> Self {
        Self {
            projects,
            modes: RenderModes::default(),
        }
    }

    pub fn projects(&self) -> &[Project] {
        &self.projects
    }

    pub fn len(&self) -> usize {
        self.projects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.projects.is_empty()
    }

    pub fn position(&self, file: &Path) -> Option<usize> {
        self.projects.iter().position(|project| project.file == file)
    }

    pub fn contains(&self, file: &Path) -> bool {
        self.position(file).is_some()
    }

    pub fn get(&self, index: usize) -> QueueResult<&Project> {
        self.projects.get(index).ok_or_else(|| self.out_of_range(index))
    }

    pub fn get_mut(&mut self, index: usize) -> QueueResult<&mut Project> {
        let len = self.projects.len();
        self.projects
            .get_mut(index)
            .ok_or_else(|| out_of_range(index, len))
    }

    /// Appends `project`, returning its index. A file can be queued once.
    pub fn enqueue(&mut self, project: Project) -> QueueResult<usize> {
        if self.contains(&project.file) {
            return Err(QueueError::validation(format!(
                "{} is already queued",
                project.file.display()
            )));
        }
        self.projects.push(project);
        Ok(self.projects.len() - 1)
    }

    pub fn remove(&mut self, index: usize) -> QueueResult<Project> {
        if index >= self.projects.len() {
            return Err(self.out_of_range(index));
        }
        Ok(self.projects.remove(index))
    }

    pub fn remove_file(&mut self, file: &Path) -> QueueResult<Project> {
        let index = self.position(file).ok_or_else(|| {
            QueueError::validation(format!("{} is not queued", file.display()))
        })?;
        self.remove(index)
    }

    /// Moves the project at `from` so it ends up at index `to`.
    pub fn reorder(&mut self, from: usize, to: usize) -> QueueResult<()> {
        let len = self.projects.len();
        if from >= len {
            return Err(out_of_range(from, len));
        }
        if to >= len {
            return Err(out_of_range(to, len));
        }
        let project = self.projects.remove(from);
        self.projects.insert(to, project);
        Ok(())
    }

    /// Flips the active flag and returns the new value.
    pub fn toggle(&mut self, index: usize) -> QueueResult<bool> {
        let project = self.get_mut(index)?;
        project.active = !project.active;
        Ok(project.active)
    }

    pub fn set_override(&mut self, index: usize, field: SettingField, value: &str) -> QueueResult<()> {
        self.get_mut(index)?.set_override(field, value)
    }

    /// Sets every project's active flag and returns how many changed.
    pub fn set_all_active(&mut self, active: bool) -> usize {
        let mut changed = 0;
        for project in self.projects.iter_mut().filter(|project| project.active != active) {
            project.active = active;
            changed += 1;
        }
        changed
    }

    /// Applies one override to every project. Nothing changes unless the
    /// value is valid for all of them.
    pub fn set_override_all(&mut self, field: SettingField, value: &str) -> QueueResult<usize> {
        let mut updated = self.projects.clone();
        for project in &mut updated {
            if let Err(error) = project.set_override(field, value) {
                tracing::warn!(project = %project.file.display(), %field, "override rejected");
                return Err(error);
            }
        }
        self.projects = updated;
        Ok(self.projects.len())
    }

    pub fn clear_override(&mut self, index: usize, field: SettingField) -> QueueResult<()> {
        self.get_mut(index)?.clear_override(field);
        Ok(())
    }

    pub fn has_renderable(&self) -> bool {
        self.projects.iter().any(Project::is_renderable)
    }

    /// Total concrete frames across renderable projects under the queue's
    /// modes. Projects whose frames cannot be computed count as zero.
    pub fn global_frames(&self) -> usize {
        self.projects
            .iter()
            .filter(|project| project.is_renderable())
            .map(|project| match project.frame_list(self.modes) {
                Ok(frames) => frames.len(),
                Err(error) => {
                    tracing::warn!(project = %project.file.display(), %error, "cannot count frames");
                    0
                }
            })
            .sum()
    }

    fn out_of_range(&self, index: usize) -> QueueError {
        out_of_range(index, self.projects.len())
    }
}

fn out_of_range(index: usize, len: usize) -> QueueError {
    QueueError::validation(format!(
        "no project at index {index} (queue has {len})"
    ))
}
