use std::io::{self, Write};

use serde::Serialize;

use crate::app::{ClearResult, GetResult, MatchResult, ProvDiffResult, RowsResult};

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_rows(result: &RowsResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_match(result: &MatchResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_get(result: &GetResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_prov_diff(result: &ProvDiffResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_clear(result: &ClearResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout().lock();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}
