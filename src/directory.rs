use std::collections::HashSet;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::RwLock;

use crate::error::StoreError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub class_id: Option<String>,
}

/// User/class lookups backed by whatever the school already has.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn lookup(&self, student_id: &str) -> Option<StudentRecord>;
    async fn class_roster(&self, class_id: &str) -> Vec<StudentRecord>;
}

#[derive(Default)]
pub struct MemoryDirectory {
    students: RwLock<Vec<StudentRecord>>,
}

impl MemoryDirectory {
    pub fn new(students: Vec<StudentRecord>) -> Self {
        MemoryDirectory {
            students: RwLock::new(students),
        }
    }

    /// Reads a JSON array of student records.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let text = fs::read_to_string(path).await?;
        let students: Vec<StudentRecord> = serde_json::from_str(&text)?;
        Ok(Self::new(students))
    }

    pub async fn len(&self) -> usize {
        self.students.read().await.len()
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn lookup(&self, student_id: &str) -> Option<StudentRecord> {
        let students = self.students.read().await;
        students.iter().find(|s| s.id == student_id).cloned()
    }

    async fn class_roster(&self, class_id: &str) -> Vec<StudentRecord> {
        let students = self.students.read().await;
        let mut seen: HashSet<&str> = HashSet::new();
        students
            .iter()
            .filter(|s| s.class_id.as_deref() == Some(class_id))
            .filter(|s| seen.insert(s.id.as_str()))
            .cloned()
            .collect()
    }
}
