use std::{
    process,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use async_trait::async_trait;
use boardcache::{
    cache::{
        CacheConfig, CacheService, FrontEnd, HtmlFrontEnd, Key, Listing, ListingPage,
        ListingSource, Page, PageError,
    },
    config,
    infra::{error::InfraError, telemetry},
};
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

const POSTS_PER_THREAD: u64 = 8;
const WRITE_EVERY: usize = 97;
const PURGE_EVERY: usize = 2_500;

#[derive(Debug, Error)]
enum AppError {
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error("cache request failed: {0}")]
    Cache(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Soak(config::SoakArgs::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Soak(args) => run_soak(settings, args).await,
    }
}

async fn run_soak(settings: config::Settings, args: config::SoakArgs) -> Result<(), AppError> {
    if args.boards == 0 || args.threads == 0 || args.concurrency == 0 {
        return Err(InfraError::configuration(
            "soak boards, threads and concurrency must be greater than zero",
        )
        .into());
    }

    let cache = Arc::new(CacheService::new(CacheConfig::from(&settings.cache)));
    let forum = Arc::new(Forum::new(args.boards, args.threads));
    let listing = Arc::new(Listing::new(BoardSource {
        forum: Arc::clone(&forum),
    }));
    let pages = ListingPage::new(Arc::clone(&cache), listing);

    info!(
        requests = args.requests,
        concurrency = args.concurrency,
        boards = args.boards,
        threads = args.threads,
        "Soak started"
    );
    let started_at = Instant::now();

    let failures = stream::iter(0..args.requests)
        .map(|request| {
            let cache = &cache;
            let forum = &forum;
            let pages = &pages;
            async move { soak_request(cache, forum, pages, request).await }
        })
        .buffer_unordered(args.concurrency)
        .filter_map(|result| async move { result.err() })
        .collect::<Vec<_>>()
        .await;

    cache.sync().await;
    let elapsed = started_at.elapsed();

    info!(
        requests = args.requests,
        failures = failures.len(),
        fetches = forum.fetches.load(Ordering::Relaxed),
        counter_checks = forum.counter_checks.load(Ordering::Relaxed),
        entries = cache.len(),
        total_bytes = cache.total_bytes(),
        max_bytes = cache.max_bytes(),
        elapsed_ms = elapsed.as_millis() as u64,
        "Soak finished"
    );

    cache.shutdown().await;

    match failures.into_iter().next() {
        Some(first) => Err(first),
        None => Ok(()),
    }
}

async fn soak_request(
    cache: &CacheService,
    forum: &Forum,
    pages: &ListingPage<BoardSource>,
    request: usize,
) -> Result<(), AppError> {
    if request % WRITE_EVERY == WRITE_EVERY - 1 {
        forum.post(request);
    }
    if request % PURGE_EVERY == PURGE_EVERY - 1 {
        cache.delete_by_board(&forum.board_name(request));
    }

    let spread = request.wrapping_mul(2_654_435_761);
    match spread % 3 {
        0 => {
            let key = Key::thread(forum.thread_id(spread), (spread % 2 * 5) as u8);
            cache
                .get_json(&key, forum)
                .await
                .map_err(|err| AppError::Cache(err.to_string()))?;
        }
        1 => {
            let key = Key::thread(forum.thread_id(spread), 0);
            cache
                .get_html(&key, forum)
                .await
                .map_err(|err| AppError::Cache(err.to_string()))?;
        }
        _ => {
            let key = Key::board(forum.board_name(spread), 0, true);
            match cache.get_html(&key, pages).await {
                Ok(_) | Err(PageError::Overflow { .. }) => {}
                Err(err) => return Err(AppError::Cache(err.to_string())),
            }
        }
    }
    Ok(())
}

#[derive(Debug, Error)]
enum ForumError {
    #[error("failed to encode: {0}")]
    Json(#[from] serde_json::Error),
}

/// Synthetic data source with one update counter per board.
struct Forum {
    boards: Vec<AtomicU64>,
    threads: u64,
    fetches: AtomicU64,
    counter_checks: AtomicU64,
}

#[derive(Debug, Serialize)]
struct ThreadView {
    id: u64,
    board: String,
    posts: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ThreadSummary {
    id: u64,
    subject: String,
}

impl Forum {
    fn new(boards: usize, threads: u64) -> Self {
        Self {
            boards: (0..boards).map(|_| AtomicU64::new(1)).collect(),
            threads,
            fetches: AtomicU64::new(0),
            counter_checks: AtomicU64::new(0),
        }
    }

    fn board_index(&self, seed: usize) -> usize {
        seed % self.boards.len()
    }

    fn board_name(&self, seed: usize) -> String {
        format!("b{}", self.board_index(seed))
    }

    fn board_of_thread(&self, id: u64) -> usize {
        (id % self.boards.len() as u64) as usize
    }

    fn thread_id(&self, seed: usize) -> u64 {
        seed as u64 % self.threads + 1
    }

    fn post(&self, seed: usize) {
        self.boards[self.board_index(seed)].fetch_add(1, Ordering::Relaxed);
    }

    fn board_counter(&self, board: usize) -> u64 {
        self.counter_checks.fetch_add(1, Ordering::Relaxed);
        self.boards[board].load(Ordering::Relaxed)
    }
}

#[async_trait]
impl FrontEnd for Forum {
    type Data = ThreadView;
    type Error = ForumError;

    async fn counter(&self, key: &Key) -> Result<u64, ForumError> {
        Ok(self.board_counter(self.board_of_thread(key.id)))
    }

    async fn fresh(&self, key: &Key) -> Result<ThreadView, ForumError> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        let board = self.board_of_thread(key.id);
        let revision = self.boards[board].load(Ordering::Relaxed);
        let shown = match key.last_n {
            0 => POSTS_PER_THREAD,
            n => u64::from(n).min(POSTS_PER_THREAD),
        };

        Ok(ThreadView {
            id: key.id,
            board: format!("b{board}"),
            posts: (POSTS_PER_THREAD - shown..POSTS_PER_THREAD)
                .map(|post| format!("post {post} of thread {} (rev {revision})", key.id))
                .collect(),
        })
    }
}

impl HtmlFrontEnd for Forum {
    fn render_html(&self, thread: &ThreadView, _json: &Bytes) -> Bytes {
        let mut html = format!("<article id=\"t{}\">", thread.id);
        for post in &thread.posts {
            html.push_str("<p>");
            html.push_str(post);
            html.push_str("</p>");
        }
        html.push_str("</article>");
        Bytes::from(html)
    }
}

struct BoardSource {
    forum: Arc<Forum>,
}

impl BoardSource {
    fn board(&self, key: &Key) -> usize {
        key.board
            .strip_prefix('b')
            .and_then(|index| index.parse().ok())
            .map_or(0, |index| self.forum.board_index(index))
    }
}

#[async_trait]
impl ListingSource for BoardSource {
    type Item = ThreadSummary;
    type Error = ForumError;

    async fn counter(&self, key: &Key) -> Result<u64, ForumError> {
        Ok(self.forum.board_counter(self.board(key)))
    }

    async fn items(&self, key: &Key) -> Result<Vec<ThreadSummary>, ForumError> {
        self.forum.fetches.fetch_add(1, Ordering::Relaxed);
        let board = self.board(key);
        Ok((1..=self.forum.threads)
            .filter(|id| self.forum.board_of_thread(*id) == board)
            .map(|id| ThreadSummary {
                id,
                subject: format!("thread {id}"),
            })
            .collect())
    }

    fn render_page(&self, page: &Page<ThreadSummary>, _json: &Bytes) -> Bytes {
        let mut html = format!("<section data-page=\"{}\">", page.number);
        for thread in &page.items {
            html.push_str(&format!("<a href=\"/t/{}\">{}</a>", thread.id, thread.subject));
        }
        html.push_str("</section>");
        Bytes::from(html)
    }
}
