//! Navigation documents: the rolling archive index and the mdBook `SUMMARY.md`.
//!
//! Both list day partitions newest first and carry no state of their own.
//!
//! ```text
//! # Summary
//!
//! [오늘의 과학 뉴스](./today.md)
//! - [최신 기사](./latest.md)
//! - [아카이브](./index.md)
//!     - [2025-05-06](./days/2025-05-06.md)
//! ```

use chrono::NaiveDate;
use std::fmt::Write;

/// `days/<date>.md`, relative to the site root.
pub fn day_document_name(date: NaiveDate) -> String {
    format!("days/{}.md", date.format("%Y-%m-%d"))
}

/// Archive index: one line per day with its article count.
pub fn index_to_markdown(days: &[(NaiveDate, usize)]) -> String {
    let mut md = String::new();
    let _ = writeln!(md, "# 아카이브\n");
    if days.is_empty() {
        md.push_str("_아직 보관된 기사가 없습니다._\n");
        return md;
    }
    let total: usize = days.iter().map(|(_, n)| n).sum();
    let _ = writeln!(md, "총 {}일, 기사 {}건\n", days.len(), total);
    for (date, count) in days.iter().rev() {
        let _ = writeln!(
            md,
            "- [**{}**](./{}) ({}건)",
            date.format("%Y-%m-%d"),
            day_document_name(*date),
            count
        );
    }
    md
}

/// mdBook navigation covering every rendered document.
pub fn summary_to_markdown(days: &[(NaiveDate, usize)]) -> String {
    let mut md = String::new();
    md.push_str("# Summary\n\n[오늘의 과학 뉴스](./today.md)\n- [최신 기사](./latest.md)\n- [아카이브](./index.md)\n");
    for (date, _) in days.iter().rev() {
        let _ = writeln!(
            md,
            "    - [{}](./{})",
            date.format("%Y-%m-%d"),
            day_document_name(*date)
        );
    }
    md
}

#[cfg(test)]
mod tests {
    use super::*;

    fn days() -> Vec<(NaiveDate, usize)> {
        vec![
            (NaiveDate::from_ymd_opt(2025, 5, 5).unwrap(), 3),
            (NaiveDate::from_ymd_opt(2025, 5, 6).unwrap(), 12),
        ]
    }

    #[test]
    fn test_index_newest_first_with_counts() {
        let md = index_to_markdown(&days());
        assert!(md.contains("총 2일, 기사 15건"));
        let newer = md.find("[**2025-05-06**](./days/2025-05-06.md) (12건)").unwrap();
        let older = md.find("[**2025-05-05**](./days/2025-05-05.md) (3건)").unwrap();
        assert!(newer < older);
    }

    #[test]
    fn test_empty_index() {
        assert!(index_to_markdown(&[]).contains("아직 보관된 기사가 없습니다"));
    }

    #[test]
    fn test_summary_lists_days() {
        let md = summary_to_markdown(&days());
        assert!(md.starts_with("# Summary\n"));
        assert!(md.contains("    - [2025-05-06](./days/2025-05-06.md)\n    - [2025-05-05](./days/2025-05-05.md)\n"));
    }
}
