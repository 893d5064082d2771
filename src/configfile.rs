//! The shared-storage `sqlconf.php` that every replica reads at startup.
//!
//! The file is PHP, but the engine treats it as a line-oriented key/value
//! document: it rewrites the values of the five connection assignments
//! (`$host`, `$port`, `$login`, `$pass`, `$dbase`) and round-trips every
//! other byte untouched. Writes are atomic (temp file + rename in the same
//! directory, file and directory fsynced) so replicas on the shared mount
//! always see either the old or the new complete file.

use std::fs;
use std::io::Write;
use std::os::unix::fs::{fchown, PermissionsExt};
use std::path::{Path, PathBuf};

use atomicwrites::{AtomicFile, OverwriteBehavior::AllowOverwrite};

use crate::errors::RotateError;
use crate::secrets::SlotCredentials;

/// The assignments the engine owns. `$login` is the DB username field;
/// OpenEMR reads both `$login` and `$pass`.
const REQUIRED_KEYS: [&str; 5] = ["host", "port", "login", "pass", "dbase"];

const FILE_MODE: u32 = 0o644;
/// The backup holds a live password; keep it out of group/world reach.
const BACKUP_MODE: u32 = 0o600;

/// Parsed view over the file contents. Mutations splice the value bytes in
/// place so unknown lines, comments and whitespace survive byte-for-byte.
#[derive(Debug, Clone)]
pub struct SqlConfDoc {
    text: String,
}

impl SqlConfDoc {
    pub fn parse(text: &str) -> Result<Self, RotateError> {
        let doc = Self {
            text: text.to_owned(),
        };
        for key in REQUIRED_KEYS {
            if doc.get(key).is_none() {
                return Err(RotateError::ConfigCorrupt(format!(
                    "sqlconf.php has no ${key} assignment; refusing to write over unknown content"
                )));
            }
        }
        Ok(doc)
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// The DB username the replicas are currently configured with.
    pub fn user(&self) -> Result<String, RotateError> {
        self.get("login").ok_or_else(|| {
            RotateError::ConfigCorrupt("sqlconf.php lost its $login assignment".into())
        })
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let (_, raw) = find_assignment(&self.text, key)?;
        Some(unescape(raw))
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<(), RotateError> {
        let (range, _) = find_assignment(&self.text, key).ok_or_else(|| {
            RotateError::ConfigCorrupt(format!("sqlconf.php has no ${key} assignment"))
        })?;
        self.text.replace_range(range, &escape(value));
        Ok(())
    }

    /// Point the file at one slot's credentials.
    pub fn apply_slot(&mut self, creds: &SlotCredentials) -> Result<(), RotateError> {
        self.set("host", &creds.host)?;
        self.set("port", &creds.port)?;
        self.set("login", &creds.username)?;
        self.set("pass", &creds.password)?;
        self.set("dbase", &creds.dbname)?;
        Ok(())
    }
}

/// Locate `$key = '...';` and return the byte range of the value together
/// with the raw (still-escaped) value text.
fn find_assignment<'a>(text: &'a str, key: &str) -> Option<(std::ops::Range<usize>, &'a str)> {
    let mut offset = 0usize;
    for line in text.split_inclusive('\n') {
        if let Some((start, end)) = parse_assignment_line(line, key) {
            return Some((offset + start..offset + end, &line[start..end]));
        }
        offset += line.len();
    }
    None
}

/// Match one line against `$<key> <ws> = <ws> '<value>' ;` with either
/// quote style. Returns the value span within the line.
fn parse_assignment_line(line: &str, key: &str) -> Option<(usize, usize)> {
    let bytes = line.as_bytes();
    let mut i = line.len() - line.trim_start().len();
    if bytes.get(i) != Some(&b'$') {
        return None;
    }
    i += 1;
    if !line[i..].starts_with(key) {
        return None;
    }
    i += key.len();
    // Reject longer identifiers sharing the prefix ($portX vs $port).
    if bytes
        .get(i)
        .is_some_and(|b| b.is_ascii_alphanumeric() || *b == b'_')
    {
        return None;
    }
    while bytes.get(i).is_some_and(|b| *b == b' ' || *b == b'\t') {
        i += 1;
    }
    if bytes.get(i) != Some(&b'=') {
        return None;
    }
    i += 1;
    while bytes.get(i).is_some_and(|b| *b == b' ' || *b == b'\t') {
        i += 1;
    }
    let quote = match bytes.get(i) {
        Some(b'\'') => b'\'',
        Some(b'"') => b'"',
        _ => return None,
    };
    i += 1;
    let start = i;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b if b == quote => {
                let end = i;
                // Must terminate the statement.
                let rest = line[end + 1..].trim_end();
                if rest.starts_with(';') {
                    return Some((start, end));
                }
                return None;
            }
            _ => i += 1,
        }
    }
    None
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\'' => out.push_str("\\'"),
            '\\' => out.push_str("\\\\"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(next @ ('\'' | '\\' | '"')) => out.push(next),
                Some(next) => {
                    out.push(c);
                    out.push(next);
                }
                None => out.push(c),
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Reader/writer for the config file and its `.bak` rollback sibling.
pub struct SqlConf {
    path: PathBuf,
    uid: Option<u32>,
    gid: Option<u32>,
}

impl SqlConf {
    pub fn new(path: impl Into<PathBuf>, uid: Option<u32>, gid: Option<u32>) -> Self {
        Self {
            path: path.into(),
            uid,
            gid,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_path(&self) -> PathBuf {
        let mut os = self.path.as_os_str().to_owned();
        os.push(".bak");
        PathBuf::from(os)
    }

    pub fn read(&self) -> Result<SqlConfDoc, RotateError> {
        let text = fs::read_to_string(&self.path)?;
        SqlConfDoc::parse(&text)
    }

    /// Refresh the `.bak` sibling with the current contents, then replace
    /// the file atomically with mode 0644 and the configured ownership.
    pub fn write(&self, doc: &SqlConfDoc) -> Result<(), RotateError> {
        self.backup_current()?;
        self.write_atomic(&self.path, doc.text().as_bytes(), FILE_MODE)
    }

    pub fn restore_from_backup(&self) -> Result<(), RotateError> {
        let prior = fs::read(self.backup_path())?;
        self.write_atomic(&self.path, &prior, FILE_MODE)
    }

    /// Removed on successful finalize; absence is not an error.
    pub fn remove_backup(&self) -> Result<(), RotateError> {
        match fs::remove_file(self.backup_path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn backup_exists(&self) -> bool {
        self.backup_path().exists()
    }

    /// Repair owner/mode without touching contents. Stale 0600/root state
    /// from a crashed run makes the application unreadable; this is the
    /// whole job of `--fix-permissions`.
    pub fn fix_permissions(&self) -> Result<(), RotateError> {
        fs::set_permissions(&self.path, fs::Permissions::from_mode(FILE_MODE))?;
        if self.uid.is_some() || self.gid.is_some() {
            std::os::unix::fs::chown(&self.path, self.uid, self.gid)?;
        }
        Ok(())
    }

    fn backup_current(&self) -> Result<(), RotateError> {
        let current = fs::read(&self.path)?;
        self.write_atomic(&self.backup_path(), &current, BACKUP_MODE)
    }

    fn write_atomic(&self, path: &Path, data: &[u8], mode: u32) -> Result<(), RotateError> {
        let uid = self.uid;
        let gid = self.gid;
        AtomicFile::new(path, AllowOverwrite)
            .write(|f| {
                f.write_all(data)?;
                // Permissions land on the temp file so readers never see an
                // intermediate unreadable state after the rename.
                f.set_permissions(fs::Permissions::from_mode(mode))?;
                if uid.is_some() || gid.is_some() {
                    fchown(f, uid, gid)?;
                }
                Ok::<(), std::io::Error>(())
            })
            .map_err(|e| {
                RotateError::TransientIo(format!("atomic write of {} failed: {e}", path.display()))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = "<?php\n\
        //  OpenEMR MySQL connection\n\
        $host\t= 'db.example.internal';\n\
        $port\t= '3306';\n\
        $login\t= 'openemr_a';\n\
        $pass\t= 'old-password';\n\
        $dbase\t= 'openemr';\n\
        $config = 1;\n\
        ?>\n";

    fn creds_b() -> SlotCredentials {
        SlotCredentials {
            username: "openemr_b".into(),
            password: "new-password".into(),
            host: "db.example.internal".into(),
            port: "3306".into(),
            dbname: "openemr".into(),
        }
    }

    fn conf_in(dir: &TempDir) -> SqlConf {
        let path = dir.path().join("sqlconf.php");
        fs::write(&path, SAMPLE).unwrap();
        SqlConf::new(path, None, None)
    }

    #[test]
    fn parses_the_connection_assignments() {
        let doc = SqlConfDoc::parse(SAMPLE).unwrap();
        assert_eq!(doc.get("host").as_deref(), Some("db.example.internal"));
        assert_eq!(doc.get("port").as_deref(), Some("3306"));
        assert_eq!(doc.user().unwrap(), "openemr_a");
        assert_eq!(doc.get("pass").as_deref(), Some("old-password"));
        assert_eq!(doc.get("dbase").as_deref(), Some("openemr"));
    }

    #[test]
    fn missing_required_key_is_corrupt() {
        let err = SqlConfDoc::parse("<?php\n$host = 'h';\n").unwrap_err();
        assert!(matches!(err, RotateError::ConfigCorrupt(_)));
    }

    #[test]
    fn flip_rewrites_only_the_values() {
        let mut doc = SqlConfDoc::parse(SAMPLE).unwrap();
        doc.apply_slot(&creds_b()).unwrap();
        assert_eq!(doc.user().unwrap(), "openemr_b");
        assert_eq!(doc.get("pass").as_deref(), Some("new-password"));
        // Everything the engine does not own survives byte-for-byte.
        assert!(doc.text().contains("//  OpenEMR MySQL connection"));
        assert!(doc.text().contains("$config = 1;"));
        assert!(doc.text().starts_with("<?php\n"));
        assert!(doc.text().ends_with("?>\n"));
        assert!(doc.text().contains("$login\t= 'openemr_b';"));
    }

    #[test]
    fn write_of_unchanged_doc_is_content_noop() {
        let dir = TempDir::new().unwrap();
        let conf = conf_in(&dir);
        let doc = conf.read().unwrap();
        conf.write(&doc).unwrap();
        assert_eq!(fs::read_to_string(conf.path()).unwrap(), SAMPLE);
        let mode = fs::metadata(conf.path()).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, FILE_MODE);
    }

    #[test]
    fn passwords_with_quotes_round_trip() {
        let mut doc = SqlConfDoc::parse(SAMPLE).unwrap();
        doc.set("pass", "it's a \\ tricky' one").unwrap();
        let reparsed = SqlConfDoc::parse(doc.text()).unwrap();
        assert_eq!(reparsed.get("pass").as_deref(), Some("it's a \\ tricky' one"));
    }

    #[test]
    fn prefix_keys_do_not_shadow_each_other() {
        let text = "<?php\n$portal = 'yes';\n$host = 'h';\n$port = '3306';\n\
                    $login = 'u';\n$pass = 'p';\n$dbase = 'd';\n";
        let doc = SqlConfDoc::parse(text).unwrap();
        assert_eq!(doc.get("port").as_deref(), Some("3306"));
    }

    #[test]
    fn backup_restore_round_trip() {
        let dir = TempDir::new().unwrap();
        let conf = conf_in(&dir);

        let mut doc = conf.read().unwrap();
        doc.apply_slot(&creds_b()).unwrap();
        conf.write(&doc).unwrap();

        assert!(conf.backup_exists());
        assert_eq!(fs::read_to_string(conf.backup_path()).unwrap(), SAMPLE);
        assert!(fs::read_to_string(conf.path())
            .unwrap()
            .contains("openemr_b"));

        conf.restore_from_backup().unwrap();
        assert_eq!(fs::read_to_string(conf.path()).unwrap(), SAMPLE);
    }

    #[test]
    fn remove_backup_tolerates_absence() {
        let dir = TempDir::new().unwrap();
        let conf = conf_in(&dir);
        conf.remove_backup().unwrap();

        let doc = conf.read().unwrap();
        conf.write(&doc).unwrap();
        assert!(conf.backup_exists());
        conf.remove_backup().unwrap();
        assert!(!conf.backup_exists());
    }

    #[test]
    fn fix_permissions_restores_mode_without_touching_contents() {
        let dir = TempDir::new().unwrap();
        let conf = conf_in(&dir);
        fs::set_permissions(conf.path(), fs::Permissions::from_mode(0o600)).unwrap();

        conf.fix_permissions().unwrap();

        let mode = fs::metadata(conf.path()).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, FILE_MODE);
        assert_eq!(fs::read_to_string(conf.path()).unwrap(), SAMPLE);
    }
}
