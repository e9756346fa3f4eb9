use crate::io::workspace::commit_with;
use crate::types::{GlacierResult, OrbitPairRecord};
use std::path::{Path, PathBuf};

/// `<unit>_orbit_pairs.csv`
pub fn table_path(dir: &Path, unit: &str) -> PathBuf {
    dir.join(format!("{}_orbit_pairs.csv", unit))
}

/// Write the orbit-pair table with a header row
pub fn write_table(path: &Path, records: &[OrbitPairRecord]) -> GlacierResult<()> {
    commit_with(path, |tmp| {
        let mut writer = csv::Writer::from_path(tmp)?;
        for record in records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    })
}

pub fn read_table(path: &Path) -> GlacierResult<Vec<OrbitPairRecord>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut records = Vec::new();
    for row in reader.deserialize() {
        records.push(row?);
    }
    Ok(records)
}
