use async_trait::async_trait;

use crate::db::models::Lab;
use crate::db::{lock, DbError, SharedDatabase};

/// The labs a user receives results from; drives the mailbox search filter.
#[async_trait]
pub trait LabDirectory: Send + Sync {
    async fn labs_for_user(&self, user_id: &str) -> Result<Vec<Lab>, DbError>;
}

pub struct SqliteLabDirectory {
    db: SharedDatabase,
}

impl SqliteLabDirectory {
    pub fn new(db: SharedDatabase) -> Self {
        Self { db }
    }

    pub fn add_lab(
        &self,
        user_id: &str,
        lab_name: &str,
        lab_email: Option<&str>,
    ) -> Result<Lab, DbError> {
        let lab_name = lab_name.trim();
        if lab_name.is_empty() {
            return Err(DbError::Config("lab name must not be empty".to_string()));
        }
        let lab_email = lab_email.map(str::trim).filter(|email| !email.is_empty());
        lock(&self.db)?.insert_lab(user_id, lab_name, lab_email)
    }

    /// Returns whether a lab with that id existed.
    pub fn remove_lab(&self, lab_id: i64) -> Result<bool, DbError> {
        Ok(lock(&self.db)?.remove_lab(lab_id)? > 0)
    }
}

#[async_trait]
impl LabDirectory for SqliteLabDirectory {
    async fn labs_for_user(&self, user_id: &str) -> Result<Vec<Lab>, DbError> {
        lock(&self.db)?.labs_for_user(user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::{LabDirectory, SqliteLabDirectory};
    use crate::db::{shared, Database};

    #[tokio::test]
    async fn labs_are_scoped_per_user() {
        let directory = SqliteLabDirectory::new(shared(Database::open_in_memory().expect("db")));
        let acme = directory
            .add_lab("42", " Acme Labs ", Some("labs@acme.test"))
            .expect("add acme");
        directory.add_lab("42", "Beta Diagnostics", Some("  ")).expect("add beta");
        directory.add_lab("7", "Other", None).expect("add other");

        let labs = directory.labs_for_user("42").await.expect("labs");
        assert_eq!(labs.len(), 2);
        assert_eq!(labs[0].lab_name, "Acme Labs");
        assert_eq!(labs[1].lab_email, None);

        assert!(directory.remove_lab(acme.lab_id).expect("remove"));
        assert!(!directory.remove_lab(acme.lab_id).expect("remove again"));
        assert_eq!(directory.labs_for_user("42").await.expect("labs").len(), 1);
    }

    #[test]
    fn blank_lab_name_is_rejected() {
        let directory = SqliteLabDirectory::new(shared(Database::open_in_memory().expect("db")));
        assert!(directory.add_lab("42", "   ", None).is_err());
    }
}
