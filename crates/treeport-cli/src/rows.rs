use std::io::Read;

use anyhow::{bail, Context, Result};
use csv::{ReaderBuilder, Trim};

/// Parse comma-separated feature rows into a row-major matrix.
///
/// Blank lines and lines starting with `#` are skipped. An empty field is a
/// missing value and becomes NaN.
pub fn parse_rows<R: Read>(reader: R, num_feature: usize) -> Result<Vec<f32>> {
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .comment(Some(b'#'))
        .trim(Trim::All)
        .flexible(true)
        .from_reader(reader);

    let mut values = Vec::new();
    for record in reader.records() {
        let record = record?;
        let line = record.position().map_or(0, |p| p.line());
        if record.len() != num_feature {
            bail!(
                "line {line}: expected {num_feature} fields, found {}",
                record.len()
            );
        }

        for field in &record {
            let value = if field.is_empty() {
                f32::NAN
            } else {
                field
                    .parse::<f32>()
                    .with_context(|| format!("line {line}: invalid number `{field}`"))?
            };
            values.push(value);
        }
    }
    Ok(values)
}

pub fn format_row(values: &[f32]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(",")
}
