use std::fs;
use std::io::{self, Write};
use std::path::Path;

use serde::Serialize;

use crate::batch::BatchReport;
use crate::error::XnatError;
use crate::metadata::MetadataSummary;

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_batch(report: &BatchReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn write_metadata(summary: &MetadataSummary, path: &Path) -> Result<(), XnatError> {
        let mut json = serde_json::to_vec_pretty(summary).map_err(XnatError::fs)?;
        json.push(b'\n');
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(XnatError::fs)?;
        }
        fs::write(path, json).map_err(XnatError::fs)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}
