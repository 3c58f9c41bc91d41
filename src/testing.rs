//! In-memory stand-ins for the SIS and the directory.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Mutex;

use crate::{
    School, SchoolStaffRecord, StaffMember,
    db::{DBError, SourceStore},
    google::{AccountUpdate, Directory, DirectoryAccount, GoogleApiError},
};

/// A staff member with email `<dcid>@d118.org`
pub fn staff_member(dcid: i64, home_school: i64, access: &[&str]) -> StaffMember {
    StaffMember {
        dcid,
        email: format!("{dcid}@d118.org"),
        first_name: "First".to_string(),
        last_name: format!("Last{dcid}"),
        teacher_number: None,
        security_group: None,
        explicit_access: access.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(),
        home_school,
    }
}

pub struct FakeDirectory {
    /// dcid in the cross-reference attribute, account
    accounts: Mutex<Vec<(i64, DirectoryAccount)>>,
    searches: Mutex<Vec<String>>,
    updates: Mutex<Vec<(String, AccountUpdate)>>,
    search_error: Mutex<Option<fn() -> GoogleApiError>>,
}
impl FakeDirectory {
    /// (dcid, email, suspended)
    pub fn with_accounts(accounts: Vec<(i64, &str, bool)>) -> Self {
        Self::from_accounts(
            accounts
                .into_iter()
                .map(|(dcid, email, suspended)| {
                    (
                        dcid,
                        DirectoryAccount {
                            primary_email: email.to_string(),
                            suspended,
                            org_unit_path: "/D118 Staff".to_string(),
                        },
                    )
                })
                .collect(),
        )
    }

    pub fn from_accounts(accounts: Vec<(i64, DirectoryAccount)>) -> Self {
        Self {
            accounts: Mutex::new(accounts),
            searches: Mutex::new(Vec::new()),
            updates: Mutex::new(Vec::new()),
            search_error: Mutex::new(None),
        }
    }

    /// Make every following search fail
    pub fn fail_search_with(&self, error: fn() -> GoogleApiError) {
        *self.search_error.lock().unwrap() = Some(error);
    }

    pub fn searches(&self) -> Vec<String> {
        self.searches.lock().unwrap().clone()
    }

    pub fn updates(&self) -> Vec<(String, AccountUpdate)> {
        self.updates.lock().unwrap().clone()
    }
}

impl Directory for FakeDirectory {
    async fn search(&self, query: &str) -> Result<Vec<DirectoryAccount>, GoogleApiError> {
        self.searches.lock().unwrap().push(query.to_owned());
        if let Some(error) = *self.search_error.lock().unwrap() {
            return Err(error());
        }
        let dcid: i64 = query
            .rsplit('=')
            .next()
            .and_then(|x| x.parse().ok())
            .unwrap();
        Ok(self
            .accounts
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == dcid)
            .map(|(_, account)| account.clone())
            .take(2)
            .collect())
    }

    async fn get(&self, user_key: &str) -> Result<DirectoryAccount, GoogleApiError> {
        self.accounts
            .lock()
            .unwrap()
            .iter()
            .find(|(_, account)| account.primary_email == user_key)
            .map(|(_, account)| account.clone())
            .ok_or_else(|| GoogleApiError::NotFound(user_key.to_owned()))
    }

    async fn update(&self, user_key: &str, update: &AccountUpdate) -> Result<(), GoogleApiError> {
        self.updates
            .lock()
            .unwrap()
            .push((user_key.to_owned(), update.clone()));
        for (_, account) in self.accounts.lock().unwrap().iter_mut() {
            if account.primary_email == user_key {
                account.suspended = update.suspended;
                if let Some(ou) = &update.org_unit_path {
                    account.org_unit_path = ou.clone();
                }
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeSource {
    pub schools: Vec<School>,
    /// by home school
    pub staff: HashMap<i64, Vec<StaffMember>>,
    /// by dcid
    pub records: HashMap<i64, Vec<SchoolStaffRecord>>,
    /// active_school_staff fails for these
    pub failing: HashSet<i64>,
    /// the staff query fails for these schools
    pub failing_schools: HashSet<i64>,
    pub looked_up: Mutex<Vec<i64>>,
}

impl SourceStore for FakeSource {
    async fn schools(&self) -> Result<Vec<School>, DBError> {
        Ok(self.schools.clone())
    }

    async fn staff_for_school(
        &self,
        school_number: i64,
    ) -> Result<Vec<Result<StaffMember, DBError>>, DBError> {
        if self.failing_schools.contains(&school_number) {
            return Err(DBError::SelectStaff(
                school_number,
                sqlx::Error::PoolTimedOut.into(),
            ));
        }
        Ok(self
            .staff
            .get(&school_number)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(Ok)
            .collect())
    }

    async fn active_school_staff(&self, dcid: i64) -> Result<Vec<SchoolStaffRecord>, DBError> {
        self.looked_up.lock().unwrap().push(dcid);
        if self.failing.contains(&dcid) {
            return Err(DBError::SelectSchoolStaff(dcid, sqlx::Error::RowNotFound.into()));
        }
        Ok(self.records.get(&dcid).cloned().unwrap_or_default())
    }
}
