//! All the db-related functions
//!
//! The SIS database is only ever read. All queries are parameterized.
//! Production PowerSchool runs on Oracle ([`OracleSource`]); anything sqlx can reach by url
//! goes through [`SqlSource`].

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use futures::TryStreamExt;
use sqlx::{AnyPool, Row, any::AnyPoolOptions, any::AnyRow};
use tracing::{debug, error, warn};

use crate::config::{SourceConfig, SourceConnection};
use crate::{School, SchoolStaffRecord, StaffMember};

// Queries are written with `$1` binds. Oracle gets them rewritten to `:1`.
const SELECT_SCHOOLS: &str = "SELECT name, school_number FROM schools ORDER BY school_number";

// users without an email are test or temp accounts that never got a directory account
const SELECT_STAFF_FOR_SCHOOL: &str = "SELECT dcid, email_addr, first_name, last_name, teachernumber, groupvalue, canchangeschool \
     FROM users \
     WHERE email_addr IS NOT NULL AND homeschoolid = $1 \
     ORDER BY dcid DESC";

const SELECT_ACTIVE_SCHOOL_STAFF: &str = "SELECT schoolstaff.schoolid, schoolstaff.status, schoolstaff.staffstatus, u_def_ext_schoolstaff.hr_cellphone \
     FROM schoolstaff \
     LEFT JOIN u_def_ext_schoolstaff ON schoolstaff.dcid = u_def_ext_schoolstaff.schoolstaffdcid \
     WHERE schoolstaff.users_dcid = $1 AND schoolstaff.status = 1 \
     ORDER BY schoolstaff.schoolid";

/// Error from one of the database drivers
#[derive(Debug)]
pub enum DriverError {
    Sqlx(sqlx::Error),
    Oracle(oracle::Error),
    /// The blocking task running an Oracle call died or left the connection poisoned
    Worker(String),
}
impl std::fmt::Display for DriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Sqlx(e) => write!(f, "{e}"),
            Self::Oracle(e) => write!(f, "{e}"),
            Self::Worker(e) => write!(f, "Oracle worker failed: {e}"),
        }
    }
}
impl std::error::Error for DriverError {}
impl From<sqlx::Error> for DriverError {
    fn from(value: sqlx::Error) -> Self {
        Self::Sqlx(value)
    }
}
impl From<oracle::Error> for DriverError {
    fn from(value: oracle::Error) -> Self {
        Self::Oracle(value)
    }
}

#[derive(Debug)]
pub enum DBError {
    Connect(DriverError),
    SelectSchools(DriverError),
    /// school number, inner error
    SelectStaff(i64, DriverError),
    /// A single users row could not be decoded. Contains the DCID if that much was readable.
    DecodeStaff(Option<i64>, DriverError),
    /// DCID, inner error
    SelectSchoolStaff(i64, DriverError),
}
impl DBError {
    /// The DCID of the staff member this error is about, if any
    pub fn dcid(&self) -> Option<i64> {
        match self {
            Self::DecodeStaff(dcid, _) => *dcid,
            Self::SelectSchoolStaff(dcid, _) => Some(*dcid),
            Self::Connect(_) | Self::SelectSchools(_) | Self::SelectStaff(_, _) => None,
        }
    }
}
impl std::fmt::Display for DBError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Connect(e) => {
                write!(f, "Unable to connect to the DB. Inner Error: {e}.")
            }
            Self::SelectSchools(e) => {
                write!(f, "Unable to select schools from the DB. Inner Error: {e}.")
            }
            Self::SelectStaff(school, e) => {
                write!(
                    f,
                    "Unable to select staff of school {school} from the DB. Inner Error: {e}."
                )
            }
            Self::DecodeStaff(Some(dcid), e) => {
                write!(f, "Unable to decode users row for DCID {dcid}. Inner Error: {e}.")
            }
            Self::DecodeStaff(None, e) => {
                write!(f, "Unable to decode a users row. Inner Error: {e}.")
            }
            Self::SelectSchoolStaff(dcid, e) => {
                write!(
                    f,
                    "Unable to select schoolstaff entries for DCID {dcid} from the DB. Inner Error: {e}."
                )
            }
        }
    }
}
impl std::error::Error for DBError {}

/// Read access to the staff data of the SIS.
pub(crate) trait SourceStore {
    /// All schools.
    async fn schools(&self) -> Result<Vec<School>, DBError>;

    /// All staff whose home school is `school_number` and that have an email, highest DCID
    /// first.
    ///
    /// The outer error means the query failed. Single rows that cannot be decoded are returned
    /// as inner errors so the caller can skip just that staff member.
    async fn staff_for_school(
        &self,
        school_number: i64,
    ) -> Result<Vec<Result<StaffMember, DBError>>, DBError>;

    /// The active schoolstaff rows of a staff member, ordered by school.
    async fn active_school_staff(&self, dcid: i64) -> Result<Vec<SchoolStaffRecord>, DBError>;
}

/// The SIS database of a run, whichever driver it needs
pub(crate) enum SisSource {
    Oracle(OracleSource),
    Sql(SqlSource),
}
impl SisSource {
    pub async fn connect(config: &SourceConfig) -> Result<Self, DBError> {
        match &config.connection {
            SourceConnection::Oracle(dsn) => Ok(Self::Oracle(
                OracleSource::connect(&config.username, &config.password, dsn).await?,
            )),
            SourceConnection::Url(url) => Ok(Self::Sql(SqlSource::connect(url).await?)),
        }
    }

    pub async fn close(&self) {
        match self {
            Self::Oracle(x) => x.close().await,
            Self::Sql(x) => x.close().await,
        }
    }
}
impl SourceStore for SisSource {
    async fn schools(&self) -> Result<Vec<School>, DBError> {
        match self {
            Self::Oracle(x) => x.schools().await,
            Self::Sql(x) => x.schools().await,
        }
    }

    async fn staff_for_school(
        &self,
        school_number: i64,
    ) -> Result<Vec<Result<StaffMember, DBError>>, DBError> {
        match self {
            Self::Oracle(x) => x.staff_for_school(school_number).await,
            Self::Sql(x) => x.staff_for_school(school_number).await,
        }
    }

    async fn active_school_staff(&self, dcid: i64) -> Result<Vec<SchoolStaffRecord>, DBError> {
        match self {
            Self::Oracle(x) => x.active_school_staff(dcid).await,
            Self::Sql(x) => x.active_school_staff(dcid).await,
        }
    }
}

/// A users row before it is checked
struct UsersRow {
    dcid: i64,
    email: String,
    first_name: Option<String>,
    last_name: Option<String>,
    teacher_number: Option<String>,
    security_group: Option<i64>,
    access: Option<String>,
}
impl UsersRow {
    /// `None` for rows whose email is blank
    fn into_staff(self, home_school: i64) -> Option<StaffMember> {
        let email = self.email.trim();
        if email.is_empty() {
            debug!("DCID {} has a blank email, skipping.", self.dcid);
            return None;
        }
        Some(StaffMember {
            dcid: self.dcid,
            email: email.to_owned(),
            first_name: self.first_name.unwrap_or_default(),
            last_name: self.last_name.unwrap_or_default(),
            teacher_number: self.teacher_number,
            security_group: self.security_group,
            explicit_access: parse_access_list(self.access.as_deref().unwrap_or_default()),
            home_school,
        })
    }
}

/// Keep the decodable staff, pass on the rows that failed
fn collect_staff(
    rows: Vec<Result<UsersRow, DBError>>,
    home_school: i64,
) -> Vec<Result<StaffMember, DBError>> {
    rows.into_iter()
        .filter_map(|row| match row {
            Ok(row) => row.into_staff(home_school).map(Ok),
            Err(e) => {
                warn!("Skipping undecodable users row: {e}");
                Some(Err(e))
            }
        })
        .collect()
}

/// [`SourceStore`] backed by a sqlx pool.
///
/// Uses the `Any` driver so a url based database and the sqlite fixtures in tests go
/// through the same code.
pub(crate) struct SqlSource {
    pool: AnyPool,
}
impl SqlSource {
    pub async fn connect(url: &str) -> Result<Self, DBError> {
        sqlx::any::install_default_drivers();
        // the sync is strictly sequential, one connection is all we ever use
        let pool = AnyPoolOptions::new()
            .max_connections(1)
            .connect(url)
            .await
            .map_err(|e| DBError::Connect(e.into()))?;
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    #[cfg(test)]
    pub fn from_pool(pool: AnyPool) -> Self {
        Self { pool }
    }
}

impl SourceStore for SqlSource {
    async fn schools(&self) -> Result<Vec<School>, DBError> {
        sqlx::query(SELECT_SCHOOLS)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DBError::SelectSchools(e.into()))?
            .iter()
            .map(|row| -> Result<School, sqlx::Error> {
                let name: String = row.try_get("name")?;
                Ok(School {
                    name: title_case(&name),
                    number: row.try_get("school_number")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(|e| DBError::SelectSchools(e.into()))
    }

    async fn staff_for_school(
        &self,
        school_number: i64,
    ) -> Result<Vec<Result<StaffMember, DBError>>, DBError> {
        let mut rows = sqlx::query(SELECT_STAFF_FOR_SCHOOL)
            .bind(school_number)
            .fetch(&self.pool);
        let mut users = Vec::new();
        while let Some(row) = rows
            .try_next()
            .await
            .map_err(|e| DBError::SelectStaff(school_number, e.into()))?
        {
            users.push(users_row_from_any(&row));
        }
        Ok(collect_staff(users, school_number))
    }

    async fn active_school_staff(&self, dcid: i64) -> Result<Vec<SchoolStaffRecord>, DBError> {
        sqlx::query(SELECT_ACTIVE_SCHOOL_STAFF)
            .bind(dcid)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DBError::SelectSchoolStaff(dcid, e.into()))?
            .iter()
            .map(|row| -> Result<SchoolStaffRecord, sqlx::Error> {
                Ok(SchoolStaffRecord {
                    school_id: row.try_get("schoolid")?,
                    status: row.try_get("status")?,
                    staff_status: row.try_get("staffstatus")?,
                    cell_phone: row.try_get("hr_cellphone")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(|e| DBError::SelectSchoolStaff(dcid, e.into()))
    }
}

fn users_row_from_any(row: &AnyRow) -> Result<UsersRow, DBError> {
    let dcid: i64 = row
        .try_get("dcid")
        .map_err(|e| DBError::DecodeStaff(None, e.into()))?;
    let decode_err = |e: sqlx::Error| DBError::DecodeStaff(Some(dcid), e.into());
    Ok(UsersRow {
        dcid,
        email: row.try_get("email_addr").map_err(decode_err)?,
        first_name: row.try_get("first_name").map_err(decode_err)?,
        last_name: row.try_get("last_name").map_err(decode_err)?,
        teacher_number: row.try_get("teachernumber").map_err(decode_err)?,
        security_group: row.try_get("groupvalue").map_err(decode_err)?,
        access: row.try_get("canchangeschool").map_err(decode_err)?,
    })
}

/// [`SourceStore`] for the PowerSchool Oracle database.
///
/// The driver is blocking, so every call runs on tokio's blocking pool. There is only one
/// connection, shared behind a mutex.
pub(crate) struct OracleSource {
    conn: Arc<Mutex<oracle::Connection>>,
}
impl OracleSource {
    /// `dsn` is an easy connect string like `host:1521/PSPRODDB`
    pub async fn connect(username: &str, password: &str, dsn: &str) -> Result<Self, DBError> {
        let (username, password, dsn) = (username.to_owned(), password.to_owned(), dsn.to_owned());
        let conn = tokio::task::spawn_blocking(move || {
            oracle::Connection::connect(username, password, dsn)
        })
        .await
        .map_err(|e| DBError::Connect(DriverError::Worker(e.to_string())))?
        .map_err(|e| DBError::Connect(e.into()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn close(&self) {
        if let Err(e) = self.with_connection(|conn| Ok(conn.close()?)).await {
            error!("Failed to close the Oracle connection: {e}");
        }
    }

    /// Run `f` against the connection on the blocking pool
    async fn with_connection<T, F>(&self, f: F) -> Result<T, DriverError>
    where
        T: Send + 'static,
        F: FnOnce(&oracle::Connection) -> Result<T, DriverError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|e| DriverError::Worker(e.to_string()))?;
            f(&conn)
        })
        .await
        .map_err(|e| DriverError::Worker(e.to_string()))?
    }
}

/// Oracle binds positionally with `:1`
fn oracle_sql(query: &str) -> String {
    query.replace("$1", ":1")
}

impl SourceStore for OracleSource {
    async fn schools(&self) -> Result<Vec<School>, DBError> {
        self.with_connection(|conn| {
            let mut schools = Vec::new();
            for row in conn.query_as::<(String, i64)>(SELECT_SCHOOLS, &[])? {
                let (name, number) = row?;
                schools.push(School {
                    name: title_case(&name),
                    number,
                });
            }
            Ok(schools)
        })
        .await
        .map_err(DBError::SelectSchools)
    }

    async fn staff_for_school(
        &self,
        school_number: i64,
    ) -> Result<Vec<Result<StaffMember, DBError>>, DBError> {
        let users = self
            .with_connection(move |conn| {
                let mut users = Vec::new();
                for row in conn.query(&oracle_sql(SELECT_STAFF_FOR_SCHOOL), &[&school_number])? {
                    users.push(users_row_from_oracle(&row?));
                }
                Ok(users)
            })
            .await
            .map_err(|e| DBError::SelectStaff(school_number, e))?;
        Ok(collect_staff(users, school_number))
    }

    async fn active_school_staff(&self, dcid: i64) -> Result<Vec<SchoolStaffRecord>, DBError> {
        self.with_connection(move |conn| {
            let mut records = Vec::new();
            let rows = conn.query_as::<(i64, i64, Option<i64>, Option<String>)>(
                &oracle_sql(SELECT_ACTIVE_SCHOOL_STAFF),
                &[&dcid],
            )?;
            for row in rows {
                let (school_id, status, staff_status, cell_phone) = row?;
                records.push(SchoolStaffRecord {
                    school_id,
                    status,
                    staff_status,
                    cell_phone,
                });
            }
            Ok(records)
        })
        .await
        .map_err(|e| DBError::SelectSchoolStaff(dcid, e))
    }
}

/// Columns in the order of [`SELECT_STAFF_FOR_SCHOOL`]. `canchangeschool` is a CLOB.
fn users_row_from_oracle(row: &oracle::Row) -> Result<UsersRow, DBError> {
    let dcid: i64 = row
        .get(0_usize)
        .map_err(|e| DBError::DecodeStaff(None, e.into()))?;
    let decode_err = |e: oracle::Error| DBError::DecodeStaff(Some(dcid), e.into());
    Ok(UsersRow {
        dcid,
        email: row.get(1_usize).map_err(decode_err)?,
        first_name: row.get(2_usize).map_err(decode_err)?,
        last_name: row.get(3_usize).map_err(decode_err)?,
        teacher_number: row.get(4_usize).map_err(decode_err)?,
        security_group: row.get(5_usize).map_err(decode_err)?,
        access: row.get(6_usize).map_err(decode_err)?,
    })
}

/// Parse the semicolon delimited list of school codes a user can change into.
pub fn parse_access_list(raw: &str) -> BTreeSet<String> {
    raw.split(';')
        .map(str::trim)
        .filter(|code| !code.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Uppercase the first letter of every word, lowercase the rest.
///
/// School names are stored in all caps for some schools.
fn title_case(name: &str) -> String {
    let mut res = String::with_capacity(name.len());
    let mut in_word = false;
    for c in name.chars() {
        if c.is_alphabetic() {
            if in_word {
                res.extend(c.to_lowercase());
            } else {
                res.extend(c.to_uppercase());
            }
            in_word = true;
        } else {
            res.push(c);
            in_word = false;
        }
    }
    res
}
