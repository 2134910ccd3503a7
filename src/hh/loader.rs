use std::sync::Arc;

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use rusqlite::Connection;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use super::client::HhClient;
use super::vacancy::SearchQuery;
use crate::db::{self, VacancyRow};

/// Load stats returned after completion.
#[derive(Debug, Default)]
pub struct LoadStats {
    pub pages: u32,
    pub failed_pages: u32,
    pub fetched: usize,
    pub failed: usize,
    pub saved: usize,
}

/// Walk search pages, fetch every vacancy on a page concurrently and save the page in one transaction.
///
/// At most `concurrency` detail requests are in flight. Failed pages and details are logged and skipped.
pub async fn load_vacancies(
    conn: &Connection,
    client: Arc<HhClient>,
    query: &SearchQuery,
    total: u32,
    concurrency: usize,
) -> Result<LoadStats> {
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let mut stats = LoadStats::default();
    let mut remaining = total as usize;
    let mut last_page = query.pages_for(total);

    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")?
            .progress_chars("=> "),
    );

    let mut page = 0;
    while page < last_page && remaining > 0 {
        let search = match client.search(query, page).await {
            Ok(search) => search,
            Err(e) => {
                warn!(page, "search page failed: {}", e);
                stats.failed_pages += 1;
                page += 1;
                continue;
            }
        };
        stats.pages += 1;
        if page == 0 {
            info!(found = search.found, pages = search.pages, "search results");
        }
        // The API reports fewer pages than requested once results run out.
        if search.pages > 0 {
            last_page = last_page.min(search.pages);
        }
        if search.items.is_empty() {
            break;
        }

        let ids: Vec<String> = search
            .items
            .into_iter()
            .take(remaining)
            .map(|item| item.id)
            .collect();
        remaining -= ids.len();

        let rows = fetch_details(&client, &semaphore, ids, &pb, &mut stats).await;
        let saved = db::insert_vacancies(conn, &rows)?;
        info!(page, saved, "saved vacancies");
        stats.saved += saved;
        page += 1;
    }

    pb.finish_and_clear();
    info!(
        "Loaded {} pages ({} failed), {} vacancies ({} failed)",
        stats.pages, stats.failed_pages, stats.fetched, stats.failed
    );
    Ok(stats)
}

async fn fetch_details(
    client: &Arc<HhClient>,
    semaphore: &Arc<Semaphore>,
    ids: Vec<String>,
    pb: &ProgressBar,
    stats: &mut LoadStats,
) -> Vec<VacancyRow> {
    // Channel: workers send results, caller collects the page
    let (tx, mut rx) = tokio::sync::mpsc::channel(ids.len().max(1));

    for id in ids {
        let client = Arc::clone(client);
        let sem = Arc::clone(semaphore);
        let tx = tx.clone();

        tokio::spawn(async move {
            let Ok(_permit) = sem.acquire().await else {
                return;
            };
            let result = client.vacancy(&id).await;
            let _ = tx.send((id, result)).await;
        });
    }

    // Drop our copy of tx so rx closes when all spawned tasks finish
    drop(tx);

    let mut rows = Vec::new();
    while let Some((id, result)) = rx.recv().await {
        match result {
            Ok(detail) => {
                stats.fetched += 1;
                rows.push(VacancyRow::from(detail));
            }
            Err(e) => {
                warn!(id = %id, "vacancy fetch failed: {}", e);
                stats.failed += 1;
            }
        }
        pb.inc(1);
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use reqwest::StatusCode;
    use serde_json::json;

    use crate::hh::HhError;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn query_page(path: &str) -> Option<u32> {
        let query = path.split_once('?')?.1;
        query
            .split('&')
            .find_map(|kv| kv.strip_prefix("page="))
            .and_then(|p| p.parse().ok())
    }

    /// Failures `/vacancies/flaky` answers with before it starts succeeding.
    const FLAKY_FAILURES: usize = 2;

    fn detail(id: &str) -> String {
        json!({
            "id": id,
            "name": format!("Middle Python Developer #{id}"),
            "employer": { "name": "МТС" },
            "description": "<p>Python</p>",
            "key_skills": [ { "name": "Python" }, { "name": "SQL" } ]
        })
        .to_string()
    }

    /// Two search pages (ids 1-3, 4-5); vacancy 2 always fails.
    /// Searching for `flaky` yields the single vacancy `flaky`, which fails with 503 a few times first.
    fn route(path: &str, flaky_hits: &AtomicUsize) -> (&'static str, String) {
        if path.starts_with("/vacancies?") {
            let ids: &[&str] = if path.contains("text=flaky") {
                match query_page(path) {
                    Some(0) => &["flaky"],
                    _ => &[],
                }
            } else {
                match query_page(path) {
                    Some(0) => &["1", "2", "3"],
                    Some(1) => &["4", "5"],
                    _ => &[],
                }
            };
            let pages = if path.contains("text=flaky") { 1 } else { 2 };
            let items: Vec<_> = ids.iter().map(|id| json!({ "id": id })).collect();
            let body = json!({ "items": items, "found": 5, "pages": pages });
            return ("200 OK", body.to_string());
        }
        match path.strip_prefix("/vacancies/") {
            Some("2") => ("500 Internal Server Error", "{}".to_string()),
            Some("flaky") => {
                if flaky_hits.fetch_add(1, Ordering::SeqCst) < FLAKY_FAILURES {
                    ("503 Service Unavailable", "{}".to_string())
                } else {
                    ("200 OK", detail("flaky"))
                }
            }
            Some(id) => ("200 OK", detail(id)),
            None => ("404 Not Found", "{}".to_string()),
        }
    }

    /// Stub API on a free port. The counter tracks requests for `/vacancies/flaky`.
    async fn spawn_api() -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let flaky_hits = Arc::new(AtomicUsize::new(0));
        let hits = Arc::clone(&flaky_hits);
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let hits = Arc::clone(&hits);
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 8192];
                    let mut read = 0;
                    loop {
                        let n = socket.read(&mut buf[read..]).await.unwrap();
                        if n == 0 {
                            return;
                        }
                        read += n;
                        if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }
                    let request = String::from_utf8_lossy(&buf[..read]).to_string();
                    let path = request.split_whitespace().nth(1).unwrap_or("/");
                    let (status, body) = route(path, &hits);
                    let response = format!(
                        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        status,
                        body.len(),
                        body
                    );
                    socket.write_all(response.as_bytes()).await.unwrap();
                    let _ = socket.shutdown().await;
                });
            }
        });
        (format!("http://{}", addr), flaky_hits)
    }

    fn memory() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        db::init_schema(&conn, "telecom_companies").unwrap();
        conn
    }

    fn query(per_page: u32) -> SearchQuery {
        SearchQuery {
            text: "middle python".into(),
            search_field: "name".into(),
            per_page,
        }
    }

    async fn client_with_retries(max_retries: u32) -> (Arc<HhClient>, Arc<AtomicUsize>) {
        let (base, flaky_hits) = spawn_api().await;
        let client =
            HhClient::with_base_url(&base, "hh_etl-test", max_retries, Duration::from_millis(1))
                .unwrap();
        (Arc::new(client), flaky_hits)
    }

    async fn client() -> Arc<HhClient> {
        client_with_retries(0).await.0
    }

    fn saved_ids(conn: &Connection) -> Vec<String> {
        let mut stmt = conn.prepare("SELECT id FROM vacancies ORDER BY CAST(id AS INTEGER)").unwrap();
        stmt.query_map([], |r| r.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[tokio::test]
    async fn failed_details_are_skipped() {
        let conn = memory();
        let stats = load_vacancies(&conn, client().await, &query(3), 5, 2).await.unwrap();

        assert_eq!(stats.pages, 2);
        assert_eq!(stats.fetched, 4);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.saved, 4);
        assert_eq!(saved_ids(&conn), vec!["1", "3", "4", "5"]);

        let skills: String = conn
            .query_row("SELECT key_skills FROM vacancies WHERE id = '4'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(skills, "Python, SQL");
    }

    #[tokio::test]
    async fn stops_at_reported_page_count() {
        let conn = memory();
        let stats = load_vacancies(&conn, client().await, &query(3), 30, 4).await.unwrap();
        assert_eq!(stats.pages, 2);
        assert_eq!(stats.saved, 4);
    }

    #[tokio::test]
    async fn total_caps_fetched_vacancies() {
        let conn = memory();
        let stats = load_vacancies(&conn, client().await, &query(3), 2, 4).await.unwrap();
        assert_eq!(stats.pages, 1);
        assert_eq!(stats.fetched + stats.failed, 2);
        assert_eq!(saved_ids(&conn), vec!["1"]);
    }

    #[tokio::test]
    async fn retries_until_the_api_recovers() {
        let (client, hits) = client_with_retries(FLAKY_FAILURES as u32).await;
        let detail = client.vacancy("flaky").await.unwrap();
        assert_eq!(detail.id, "flaky");
        assert_eq!(hits.load(Ordering::SeqCst), FLAKY_FAILURES + 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let max_retries = 1;
        let (client, hits) = client_with_retries(max_retries).await;
        let err = client.vacancy("flaky").await.unwrap_err();
        assert!(matches!(
            err,
            HhError::Status { status, .. } if status == StatusCode::SERVICE_UNAVAILABLE
        ));
        assert_eq!(hits.load(Ordering::SeqCst), max_retries as usize + 1);
    }

    #[tokio::test]
    async fn retried_details_are_saved() {
        let flaky = SearchQuery {
            text: "flaky".into(),
            ..query(20)
        };

        let conn = memory();
        let (client, hits) = client_with_retries(FLAKY_FAILURES as u32).await;
        let stats = load_vacancies(&conn, client, &flaky, 20, 2).await.unwrap();
        assert_eq!((stats.fetched, stats.failed, stats.saved), (1, 0, 1));
        assert_eq!(saved_ids(&conn), vec!["flaky"]);
        assert_eq!(hits.load(Ordering::SeqCst), FLAKY_FAILURES + 1);

        let conn = memory();
        let (client, hits) = client_with_retries(FLAKY_FAILURES as u32 - 1).await;
        let stats = load_vacancies(&conn, client, &flaky, 20, 2).await.unwrap();
        assert_eq!((stats.fetched, stats.failed, stats.saved), (0, 1, 0));
        assert!(saved_ids(&conn).is_empty());
        assert_eq!(hits.load(Ordering::SeqCst), FLAKY_FAILURES);
    }

    #[tokio::test]
    async fn unreachable_api_fails_pages_not_the_run() {
        let conn = memory();
        let client = Arc::new(
            HhClient::with_base_url("http://127.0.0.1:9", "hh_etl-test", 0, Duration::from_millis(1))
                .unwrap(),
        );
        let stats = load_vacancies(&conn, client, &query(20), 40, 2).await.unwrap();
        assert_eq!(stats.pages, 0);
        assert_eq!(stats.failed_pages, 2);
        assert_eq!(stats.saved, 0);
    }
}
