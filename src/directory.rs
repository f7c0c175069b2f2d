use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use axum::extract::{Path as UrlPath, Query};
use axum::Extension;
use lazy_static::lazy_static;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::err::Error;
use crate::models::StudentRecord;
use crate::{breaks, proceeds, AppState, Payload};

/// One row as it arrives from a spreadsheet export: a string-keyed map
/// with no schema guarantees beyond the known alias sets below.
pub type RawRow = Map<String, Value>;

/// One source table of student rows, e.g. the export for a single
/// academic year. Distinct from `StudentRecord::batch`, the cohort label.
#[derive(Debug, Clone)]
pub struct RawBatch {
    pub name: String,
    pub rows: Vec<RawRow>,
}

impl RawBatch {
    pub fn new(name: impl Into<String>, rows: Vec<RawRow>) -> Self {
        Self {
            name: name.into(),
            rows,
        }
    }
}

// Candidate column names per logical field, tried in order. The exports
// disagree on a few headers; first non-empty value wins.
const ROLL_ALIASES: &[&str] = &["Roll Number"];
const NAME_ALIASES: &[&str] = &["Name of the Student", "Name of the Student (As per SSC)"];
const EMAIL_ALIASES: &[&str] = &["E-mail ID of the Student"];
const FATHER_ALIASES: &[&str] = &["Father's Name", "Father Name"];
const MOTHER_ALIASES: &[&str] = &["Mother's Name"];
const GENDER_ALIASES: &[&str] = &["Gender"];
const DOB_ALIASES: &[&str] = &["DOB"];
const ADDRESS_ALIASES: &[&str] = &["Address"];
const CATEGORY_ALIASES: &[&str] = &["Category"];
const CASTE_ALIASES: &[&str] = &["CASTE"];
const AADHAR_ALIASES: &[&str] = &["Aadhar No."];
const PHONE_ALIASES: &[&str] = &["Student Mobile"];
const PARENT_PHONE_ALIASES: &[&str] = &["Parent Mobile"];

lazy_static! {
    static ref DEPARTMENT_CODES: HashMap<&'static str, &'static str> = HashMap::from([
        ("01", "CSE"),
        ("02", "ECE"),
        ("03", "EEE"),
        ("04", "CIVIL"),
        ("05", "MECH"),
        ("12", "IT"),
    ]);
}

fn field(row: &RawRow, aliases: &[&str]) -> String {
    for key in aliases {
        match row.get(*key) {
            Some(Value::String(s)) if !s.is_empty() => return s.clone(),
            Some(Value::Number(n)) => return n.to_string(),
            _ => {}
        }
    }
    String::new()
}

/// Cohort label from the roll-number prefix, e.g. `197Z1A0101` -> 2019
/// admission -> "2019-23". Unknown prefixes yield an empty label.
fn batch_label(roll: &str) -> &'static str {
    if roll.starts_with("19") {
        "2019-23"
    } else if roll.starts_with("20") {
        "2020-24"
    } else if roll.starts_with("21") {
        "2021-25"
    } else {
        ""
    }
}

/// Department from the two-character code at roll positions 6..8,
/// e.g. `197Z1A0101` -> "01" -> CSE. Short rolls and unmapped codes
/// yield an empty department.
fn department(roll: &str) -> &'static str {
    match roll.get(6..8) {
        Some(code) => DEPARTMENT_CODES.get(code).copied().unwrap_or(""),
        None => "",
    }
}

fn normalize_batch(batch: &RawBatch) -> Vec<StudentRecord> {
    batch
        .rows
        .iter()
        .enumerate()
        .filter_map(|(index, row)| {
            let roll = field(row, ROLL_ALIASES);
            // Blank or header row
            if roll.is_empty() {
                return None;
            }
            Some(StudentRecord {
                // Unique within one load; not stable across reloads if
                // batch contents shift. The roll number is the stable key.
                id: format!("student_{}_{}", index, batch.name),
                name: field(row, NAME_ALIASES),
                email: field(row, EMAIL_ALIASES),
                batch: batch_label(&roll).to_string(),
                department: department(&roll).to_string(),
                father_name: field(row, FATHER_ALIASES),
                mother_name: field(row, MOTHER_ALIASES),
                gender: field(row, GENDER_ALIASES),
                dob: field(row, DOB_ALIASES),
                address: field(row, ADDRESS_ALIASES),
                category: field(row, CATEGORY_ALIASES),
                caste: field(row, CASTE_ALIASES),
                aadhar_number: field(row, AADHAR_ALIASES),
                phone_number: field(row, PHONE_ALIASES),
                parent_phone_number: field(row, PARENT_PHONE_ALIASES),
                roll_number: roll,
            })
        })
        .collect()
}

fn fallback_roster() -> Vec<StudentRecord> {
    fn synthetic(
        id: &str,
        name: &str,
        email: &str,
        batch: &str,
        department: &str,
        roll: &str,
    ) -> StudentRecord {
        StudentRecord {
            id: id.to_string(),
            name: name.to_string(),
            email: email.to_string(),
            batch: batch.to_string(),
            department: department.to_string(),
            roll_number: roll.to_string(),
            ..StudentRecord::default()
        }
    }

    vec![
        synthetic(
            "student_1",
            "Rahul Sharma",
            "rahul.sharma@example.com",
            "2019-23",
            "CSE",
            "NNRG19CS001",
        ),
        synthetic(
            "student_2",
            "Priya Patel",
            "priya.patel@example.com",
            "2020-24",
            "ECE",
            "NNRG20EC045",
        ),
        synthetic(
            "student_3",
            "Aditya Kumar",
            "aditya.kumar@example.com",
            "2019-23",
            "CSE",
            "NNRG19CS022",
        ),
        synthetic(
            "student_4",
            "Sneha Reddy",
            "sneha.reddy@example.com",
            "2020-24",
            "CSE",
            "NNRG20CS105",
        ),
        synthetic(
            "student_5",
            "Vikram Singh",
            "vikram.singh@example.com",
            "2019-23",
            "CSE",
            "NNRG19CS078",
        ),
        synthetic(
            "student_6",
            "Ananya Desai",
            "ananya.desai@example.com",
            "2020-24",
            "ECE",
            "NNRG20EC032",
        ),
    ]
}

/// The in-memory roster for one process lifetime. Raw batches are held
/// from startup; normalization runs on first access and the result is
/// cached and never mutated afterwards, so it is safe to share across
/// concurrent readers.
pub struct DirectoryService {
    batches: Vec<RawBatch>,
    roster: OnceCell<Vec<StudentRecord>>,
}

impl DirectoryService {
    pub fn new(batches: Vec<RawBatch>) -> Self {
        Self {
            batches,
            roster: OnceCell::new(),
        }
    }

    /// Reads every `*.json` batch under `dir`, in sorted filename order
    /// (the fixed batch order). Missing dirs and malformed files degrade
    /// to empty batches with a warning; ingestion itself never fails.
    pub async fn from_dir(dir: &Path) -> Self {
        Self::new(read_batches(dir).await)
    }

    pub fn load_roster(&self) -> &[StudentRecord] {
        self.roster.get_or_init(|| {
            let mut all = Vec::new();
            for batch in &self.batches {
                let records = normalize_batch(batch);
                log::info!("Processed {} students from {}", records.len(), batch.name);
                all.extend(records);
            }
            if all.is_empty() {
                log::warn!("No students loaded from any batch, using fallback roster");
                all = fallback_roster();
            }
            log::info!("Total students loaded: {}", all.len());
            all
        })
    }

    pub fn find_by_email(&self, email: &str) -> Option<&StudentRecord> {
        self.load_roster()
            .iter()
            .find(|s| s.email.eq_ignore_ascii_case(email))
    }

    /// Lookup by the roll number (the canonical key), falling back to
    /// the surrogate ingestion id.
    pub fn find_by_key(&self, key: &str) -> Option<&StudentRecord> {
        let roster = self.load_roster();
        roster
            .iter()
            .find(|s| s.roll_number == key)
            .or_else(|| roster.iter().find(|s| s.id == key))
    }
}

async fn read_batches(dir: &Path) -> Vec<RawBatch> {
    let mut paths = Vec::new();
    match tokio::fs::read_dir(dir).await {
        Ok(mut entries) => {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if path.extension().map_or(false, |ext| ext == "json") {
                    paths.push(path);
                }
            }
        }
        Err(err) => {
            log::warn!("Could not read data dir {}: {}", dir.display(), err);
            return Vec::new();
        }
    }
    paths.sort();

    let mut batches = Vec::new();
    for path in paths {
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("batch")
            .to_string();
        let rows = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<Vec<RawRow>>(&bytes) {
                Ok(rows) => rows,
                Err(err) => {
                    log::warn!("Malformed batch {}: {}", path.display(), err);
                    Vec::new()
                }
            },
            Err(err) => {
                log::warn!("Could not read batch {}: {}", path.display(), err);
                Vec::new()
            }
        };
        batches.push(RawBatch::new(name, rows));
    }
    batches
}

pub async fn list_students(Extension(state): Extension<Arc<AppState>>) -> Payload<Roster> {
    proceeds(Roster {
        students: state.directory.load_roster().to_vec(),
    })
}

pub async fn student_by_key(
    Extension(state): Extension<Arc<AppState>>,
    UrlPath(key): UrlPath<String>,
) -> Payload<StudentRecord> {
    match state.directory.find_by_key(&key) {
        Some(student) => proceeds(student.clone()),
        None => breaks(Error::NotFound {
            message: format!("No student matches `{}`", key),
        }),
    }
}

pub async fn lookup_student(
    Extension(state): Extension<Arc<AppState>>,
    Query(params): Query<LookupParams>,
) -> Payload<StudentRecord> {
    match state.directory.find_by_email(&params.email) {
        Some(student) => proceeds(student.clone()),
        None => breaks(Error::NotFound {
            message: format!("No student with email `{}`", params.email),
        }),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LookupParams {
    pub email: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Roster {
    pub students: Vec<StudentRecord>,
}
