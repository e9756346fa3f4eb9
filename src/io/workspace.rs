use crate::config::OutputLayout;
use crate::types::{GlacierResult, Period};
use std::path::{Path, PathBuf};

/// Kinds of per-unit artifact directories
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Boundary,
    Masks,
    Orbits,
    Velocities,
    Containers,
}

impl ArtifactKind {
    pub fn dir_name(&self) -> &'static str {
        match self {
            ArtifactKind::Boundary => "boundary",
            ArtifactKind::Masks => "masks",
            ArtifactKind::Orbits => "orbits",
            ArtifactKind::Velocities => "velocities",
            ArtifactKind::Containers => "containers",
        }
    }
}

/// Output directory layout for one unit and period
#[derive(Debug, Clone)]
pub struct UnitWorkspace {
    pub root: PathBuf,
    pub unit: String,
    pub layout: OutputLayout,
    pub period: Period,
}

impl UnitWorkspace {
    pub fn new<P: AsRef<Path>>(root: P, unit: &str, layout: OutputLayout, period: Period) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            unit: unit.to_string(),
            layout,
            period,
        }
    }

    pub fn with_period(&self, period: Period) -> Self {
        Self {
            period,
            ..self.clone()
        }
    }

    /// Directory for `kind`, created on demand
    pub fn dir(&self, kind: ArtifactKind) -> GlacierResult<PathBuf> {
        let mut dir = match self.layout {
            OutputLayout::PerUnit => self.root.join(&self.unit).join(kind.dir_name()),
            OutputLayout::Centralized => self.root.join(kind.dir_name()).join(&self.unit),
        };
        if let Some(sub) = self.period.dir_name() {
            dir = dir.join(sub);
        }
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Directory of one corrected field's artifacts
    pub fn field_dir(&self, field_id: &str) -> GlacierResult<PathBuf> {
        let dir = self.dir(ArtifactKind::Velocities)?.join(field_id);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

pub fn delivery_dir(root: &Path) -> GlacierResult<PathBuf> {
    let dir = root.join("delivery");
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Write an artifact through a `.partial` sibling and rename it into place.
///
/// The final name only appears once `write` succeeded; a failed write leaves
/// nothing behind.
pub fn commit_with<F>(final_path: &Path, write: F) -> GlacierResult<()>
where
    F: FnOnce(&Path) -> GlacierResult<()>,
{
    let parent = match final_path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&parent)?;
    let prefix = final_path
        .file_name()
        .map(|n| format!("{}.", n.to_string_lossy()))
        .unwrap_or_else(|| "artifact.".to_string());
    let staging = tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(".partial")
        .tempfile_in(&parent)?
        .into_temp_path();
    write(&staging)?;
    staging
        .persist(final_path)
        .map_err(|e| e.error)?;
    Ok(())
}

/// Commit raw bytes atomically
pub fn commit_bytes(final_path: &Path, bytes: &[u8]) -> GlacierResult<()> {
    commit_with(final_path, |tmp| {
        std::fs::write(tmp, bytes)?;
        Ok(())
    })
}
