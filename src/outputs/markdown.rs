//! Markdown documents for articles: the per-day pages, "today" and "latest".

use crate::models::SummarizedArticle;
use chrono::NaiveDate;
use std::fmt::Write;

const EMPTY_NOTICE: &str = "_새로 추가된 기사가 없습니다._\n";

/// One article block: heading, provenance line, summary, link to the original.
pub fn article_to_markdown(md: &mut String, article: &SummarizedArticle) {
    let published = article
        .published_at
        .map(|p| p.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "-".to_string());
    let processed = article.processed_at.format("%Y-%m-%d %H:%M UTC");

    let _ = writeln!(md, "### {}\n", article.title_ko);
    let _ = writeln!(
        md,
        "<small>`{}` · {} · 게시 {} · 처리 {}</small>\n",
        article.source_name, article.category, published, processed
    );
    let _ = writeln!(md, "{}\n", article.summary_ko);
    let _ = writeln!(md, "> {}\n", article.title_en);
    let _ = writeln!(md, "[원문 보기]({})\n", article.url);
}

fn articles_to_markdown(md: &mut String, articles: &[&SummarizedArticle]) {
    if articles.is_empty() {
        md.push_str(EMPTY_NOTICE);
        return;
    }
    for (i, article) in articles.iter().enumerate() {
        if i > 0 {
            md.push_str("---\n\n");
        }
        article_to_markdown(md, article);
    }
}

/// The archive page of one day.
pub fn day_to_markdown(date: NaiveDate, articles: &[&SummarizedArticle]) -> String {
    let mut md = String::new();
    let _ = writeln!(md, "# {} 과학 뉴스\n", date.format("%Y-%m-%d"));
    let _ = writeln!(md, "기사 {}건\n", articles.len());
    articles_to_markdown(&mut md, articles);
    md
}

/// Articles committed on the run date; explicitly empty when nothing new arrived.
pub fn today_to_markdown(today: NaiveDate, articles: &[&SummarizedArticle]) -> String {
    let mut md = String::new();
    let _ = writeln!(md, "# 오늘의 과학 뉴스 ({})\n", today.format("%Y-%m-%d"));
    articles_to_markdown(&mut md, articles);
    md
}

/// The most recent articles across every day.
pub fn latest_to_markdown(articles: &[&SummarizedArticle]) -> String {
    let mut md = String::new();
    let _ = writeln!(md, "# 최신 과학 뉴스\n");
    articles_to_markdown(&mut md, articles);
    md
}
