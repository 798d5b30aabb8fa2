//! NCBI mirror origin selection for `ingest --auto/--daily/--monthly/--list`.

use crate::error::SrakeError;
use time::OffsetDateTime;

pub const MIRROR_BASE: &str = "https://ftp.ncbi.nlm.nih.gov/sra/reports/Metadata/";

/// Full dump published on the first of each month.
pub fn monthly_url(year: i32, month: u8) -> String {
    format!("{MIRROR_BASE}NCBI_SRA_Metadata_Full_{year:04}{month:02}01.tar.gz")
}

/// Incremental daily dump.
pub fn daily_url(year: i32, month: u8, day: u8) -> String {
    format!("{MIRROR_BASE}NCBI_SRA_Metadata_{year:04}{month:02}{day:02}.tar.gz")
}

/// Latest monthly full dump URL as of `now`.
pub fn latest_monthly() -> String {
    let today = OffsetDateTime::now_utc().date();
    monthly_url(today.year(), today.month() as u8)
}

/// Yesterday's daily dump URL (the mirror publishes with a day's lag).
pub fn latest_daily() -> String {
    let yesterday = OffsetDateTime::now_utc().date().previous_day();
    match yesterday {
        Some(date) => daily_url(date.year(), date.month() as u8, date.day()),
        None => latest_monthly(),
    }
}

/// Scrape the mirror's directory listing for available archives, newest
/// last. Best-effort: the listing is plain HTML with one href per archive.
pub fn list_remote(client: &reqwest::blocking::Client) -> crate::Result<Vec<String>> {
    let body = client
        .get(MIRROR_BASE)
        .send()
        .map_err(|e| SrakeError::NetworkTransient(e.to_string()))?
        .error_for_status()
        .map_err(|e| SrakeError::NetworkFatal(e.to_string()))?
        .text()
        .map_err(|e| SrakeError::NetworkTransient(e.to_string()))?;
    Ok(parse_listing(&body))
}

fn parse_listing(html: &str) -> Vec<String> {
    let mut archives = Vec::new();
    for chunk in html.split("href=\"").skip(1) {
        let Some(end) = chunk.find('"') else {
            continue;
        };
        let name = &chunk[..end];
        if name.starts_with("NCBI_SRA_Metadata") && name.ends_with(".tar.gz") {
            let url = format!("{MIRROR_BASE}{name}");
            if !archives.contains(&url) {
                archives.push(url);
            }
        }
    }
    archives
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_shapes() {
        assert_eq!(
            monthly_url(2026, 7),
            "https://ftp.ncbi.nlm.nih.gov/sra/reports/Metadata/NCBI_SRA_Metadata_Full_20260701.tar.gz"
        );
        assert_eq!(
            daily_url(2026, 7, 31),
            "https://ftp.ncbi.nlm.nih.gov/sra/reports/Metadata/NCBI_SRA_Metadata_20260731.tar.gz"
        );
    }

    #[test]
    fn test_parse_listing() {
        let html = r#"
            <a href="NCBI_SRA_Metadata_20260730.tar.gz">daily</a>
            <a href="NCBI_SRA_Metadata_Full_20260701.tar.gz">full</a>
            <a href="NCBI_SRA_Metadata_Full_20260701.tar.gz">dup</a>
            <a href="README.txt">readme</a>
        "#;
        let archives = parse_listing(html);
        assert_eq!(archives.len(), 2);
        assert!(archives[0].ends_with("NCBI_SRA_Metadata_20260730.tar.gz"));
    }
}
