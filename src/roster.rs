//! Classlist loading and validation.
//!
//! The classlist is a CSV file with an `id,name` header. Ids must be
//! non-empty ASCII digit strings. Duplicate ids are a configuration error:
//! every duplicated id is reported at once and nothing is merged.

use crate::error::RosterError;
use crate::model::ClasslistEntry;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use tracing::info;

/// Load and validate a classlist CSV from disk.
pub fn load_classlist(path: &Path) -> Result<Vec<ClasslistEntry>, RosterError> {
    let reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|source| RosterError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    let entries = read_entries(reader, path)?;
    info!(path = %path.display(), students = entries.len(), "Classlist loaded");
    Ok(entries)
}

/// Parse and validate a classlist from any reader.
pub fn classlist_from_reader<R: Read>(rdr: R) -> Result<Vec<ClasslistEntry>, RosterError> {
    let reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(rdr);
    read_entries(reader, Path::new("<reader>"))
}

fn read_entries<R: Read>(
    mut reader: csv::Reader<R>,
    path: &Path,
) -> Result<Vec<ClasslistEntry>, RosterError> {
    let mut entries = Vec::new();
    for record in reader.deserialize() {
        let entry: ClasslistEntry = record.map_err(|source| RosterError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        entries.push(entry);
    }
    validate_classlist(&entries)?;
    Ok(entries)
}

/// Check id syntax and uniqueness.
pub fn validate_classlist(entries: &[ClasslistEntry]) -> Result<(), RosterError> {
    for (i, e) in entries.iter().enumerate() {
        if e.student_id.is_empty() || !e.student_id.bytes().all(|b| b.is_ascii_digit()) {
            return Err(RosterError::InvalidId {
                // header is row 1
                row: i + 2,
                id: e.student_id.clone(),
            });
        }
    }

    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for e in entries {
        *counts.entry(e.student_id.as_str()).or_default() += 1;
    }
    let dups: Vec<String> = counts
        .into_iter()
        .filter(|(_, n)| *n > 1)
        .map(|(id, _)| id.to_string())
        .collect();
    if !dups.is_empty() {
        return Err(RosterError::DuplicateIds { ids: dups });
    }
    Ok(())
}
