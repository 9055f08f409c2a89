use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use conduit_core::prelude::*;
use conduit_feed::{FeedConfig, FeedService};
use conduit_persist::SqliteStore;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "conduitctl", version, about = "Conduit CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// SQLite database file
    #[arg(long = "db", global = true, env = "CONDUIT_DB_PATH")]
    db: Option<String>,

    /// Act as this user (anonymous when omitted)
    #[arg(long = "as", global = true, env = "CONDUIT_VIEWER")]
    viewer: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Dir { Next, Prev }

impl From<Dir> for Direction {
    fn from(d: Dir) -> Self {
        match d {
            Dir::Next => Direction::Next,
            Dir::Prev => Direction::Prev,
        }
    }
}

#[derive(Args, Debug)]
struct PageArgs {
    /// Cursor token from a previous page's startCursor/endCursor
    #[arg(long = "cursor")]
    cursor: Option<String>,
    /// Page size; 0 returns everything (default: CONDUIT_PAGE_LIMIT or 20)
    #[arg(long = "limit", allow_negative_numbers = true)]
    limit: Option<i64>,
    /// next = older than cursor, prev = newer than cursor
    #[arg(long = "direction", value_enum, default_value_t = Dir::Next)]
    direction: Dir,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Populate a small demo dataset
    Seed,
    /// Register a user
    AddUser {
        username: String,
        #[arg(long)]
        bio: Option<String>,
        #[arg(long)]
        image: Option<String>,
    },
    /// Follow another user
    Follow { who: String, whom: String },
    /// Stop following another user
    Unfollow { who: String, whom: String },
    /// Publish an article
    Post {
        author: String,
        title: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long, default_value = "")]
        body: String,
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// Favorite an article by slug
    Favorite { user: String, slug: String },
    /// Remove a favorite
    Unfavorite { user: String, slug: String },
    /// Comment on an article
    Comment { user: String, slug: String, body: String },
    /// Recent articles, optionally filtered
    Articles {
        #[arg(long)]
        tag: Option<String>,
        #[arg(long)]
        author: Option<String>,
        #[arg(long)]
        favorited: Option<String>,
        #[command(flatten)]
        page: PageArgs,
    },
    /// Articles from authors the --as user follows
    Feed {
        #[command(flatten)]
        page: PageArgs,
    },
    /// Comments on an article
    Comments {
        slug: String,
        #[command(flatten)]
        page: PageArgs,
    },
}

fn init_tracing() {
    let env = std::env::var("CONDUIT_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("CONDUIT_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid CONDUIT_METRICS_ADDR; expected host:port");
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let store = match cli.db.as_deref() {
        Some(path) => SqliteStore::open(path)?,
        None => SqliteStore::open_default()?,
    };
    let feeds = FeedService::with_config(store, FeedConfig::from_env());
    run(cli, &feeds)
}

fn run(cli: Cli, feeds: &FeedService<SqliteStore>) -> Result<()> {
    match cli.command {
        Commands::Seed => {
            let n = seed(feeds.store())?;
            info!(articles = n, "seeded demo dataset");
            println!("seeded {} articles", n);
        }
        Commands::AddUser { username, bio, image } => {
            let u = feeds.store().create_user(&username, bio.as_deref(), image.as_deref())?;
            println!("{} {}", u.username, u.id);
        }
        Commands::Follow { who, whom } => {
            let (a, b) = (user(feeds.store(), &who)?, user(feeds.store(), &whom)?);
            feeds.store().follow(&a.id, &b.id)?;
        }
        Commands::Unfollow { who, whom } => {
            let (a, b) = (user(feeds.store(), &who)?, user(feeds.store(), &whom)?);
            feeds.store().unfollow(&a.id, &b.id)?;
        }
        Commands::Post { author, title, description, body, tags } => {
            let a = user(feeds.store(), &author)?;
            let article = feeds.store().create_article(&a.id, NewArticle { title, description, body, tags })?;
            println!("{}", article.slug);
        }
        Commands::Favorite { user: who, slug } => {
            let (u, a) = (user(feeds.store(), &who)?, article(feeds.store(), &slug)?);
            feeds.store().favorite(&u.id, &a.id)?;
        }
        Commands::Unfavorite { user: who, slug } => {
            let (u, a) = (user(feeds.store(), &who)?, article(feeds.store(), &slug)?);
            feeds.store().unfavorite(&u.id, &a.id)?;
        }
        Commands::Comment { user: who, slug, body } => {
            let (u, a) = (user(feeds.store(), &who)?, article(feeds.store(), &slug)?);
            let c = feeds.store().add_comment(&u.id, &a.id, &body)?;
            println!("{}", c.id);
        }
        Commands::Articles { tag, author, favorited, page } => {
            let filter = FeedFilter { tag, author, favorited_by: favorited };
            let req = page_request(feeds, Collection::Articles, &page)?;
            let viewer = resolve_viewer(feeds.store(), cli.viewer.as_deref())?;
            let result = feeds.fetch_recent_articles(&filter, &req, &viewer);
            print_page(cli.output, result, render_article)?;
        }
        Commands::Feed { page } => {
            let req = page_request(feeds, Collection::Articles, &page)?;
            let viewer = resolve_viewer(feeds.store(), cli.viewer.as_deref())?;
            let result = feeds.fetch_user_feed(&viewer, &req);
            print_page(cli.output, result, render_article)?;
        }
        Commands::Comments { slug, page } => {
            let a = article(feeds.store(), &slug)?;
            let req = page_request(feeds, Collection::Comments, &page)?;
            let viewer = resolve_viewer(feeds.store(), cli.viewer.as_deref())?;
            let result = feeds.fetch_article_comments(&a.id, &req, &viewer);
            print_page(cli.output, result, render_comment)?;
        }
    }
    Ok(())
}

fn resolve_viewer(store: &SqliteStore, name: Option<&str>) -> Result<ViewerContext> {
    match name {
        None => Ok(ViewerContext::Anonymous),
        Some(n) => Ok(ViewerContext::User(user(store, n)?.id)),
    }
}

fn user(store: &SqliteStore, username: &str) -> Result<Author> {
    store.user_by_username(username)?.ok_or_else(|| anyhow!("unknown user '{}'", username))
}

fn article(store: &SqliteStore, slug: &str) -> Result<Article> {
    store.article_by_slug(slug)?.ok_or_else(|| anyhow!("unknown article '{}'", slug))
}

fn page_request(feeds: &FeedService<SqliteStore>, collection: Collection, args: &PageArgs) -> Result<PageRequest> {
    let limit = args.limit.unwrap_or(feeds.config().default_limit as i64);
    PageRequest::parse(collection, args.cursor.as_deref(), limit, args.direction.into()).or_else(client_error)
}

/// Exit status for rejected requests; infrastructure failures go through `anyhow`.
const EXIT_BAD_REQUEST: i32 = 2;

fn exit_status(e: &FeedError) -> Option<i32> { e.is_client_error().then_some(EXIT_BAD_REQUEST) }

fn client_error<T>(e: FeedError) -> Result<T> {
    if let Some(code) = exit_status(&e) {
        error!(error = %e, "rejected request");
        eprintln!("bad request: {}", e);
        std::process::exit(code);
    }
    Err(e.into())
}

fn print_page<T: serde::Serialize>(output: Output, result: FeedResult<PageResult<T>>, render: fn(&T) -> String) -> Result<()> {
    let page = result.or_else(client_error)?;
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(&page)?),
        Output::Human => {
            if page.is_empty() {
                println!("(no items)");
            }
            for item in page.items.iter() {
                println!("{}", render(item));
            }
            println!(
                "-- has_next={} has_previous={} start={} end={}",
                page.has_next,
                page.has_previous,
                page.start_cursor.as_ref().map(Cursor::encode).unwrap_or_else(|| "-".into()),
                page.end_cursor.as_ref().map(Cursor::encode).unwrap_or_else(|| "-".into()),
            );
        }
    }
    Ok(())
}

fn render_article(a: &EnrichedArticle) -> String {
    let mut line = format!(
        "{:<6} {:<32} @{:<12} ♥{}",
        render_age(a.item.created_at),
        a.item.slug,
        a.item.author.username,
        a.facts.favorite_count
    );
    if a.facts.is_favorited_by_viewer { line.push_str(" [favorited]"); }
    if a.facts.is_author_followed_by_viewer { line.push_str(" [following]"); }
    if !a.item.tag_list.is_empty() { line.push_str(&format!(" #{}", a.item.tag_list.join(" #"))); }
    line
}

fn render_comment(c: &EnrichedComment) -> String {
    let follow = if c.facts.is_author_followed_by_viewer { " [following]" } else { "" };
    format!("{:<6} @{}{}: {}", render_age(c.item.created_at), c.item.author.username, follow, c.item.body)
}

fn render_age(created: Timestamp) -> String {
    let mut secs = (chrono::Utc::now() - created).num_seconds().max(0) as u64;
    let days = secs / 86_400; secs %= 86_400;
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if days > 0 { format!("{}d{}h", days, hours) }
    else if hours > 0 { format!("{}h{}m", hours, mins) }
    else if mins > 0 { format!("{}m", mins) }
    else { format!("{}s", secs) }
}

/// Demo dataset: three users, a follow graph, tagged articles, favorites and comments.
fn seed(store: &SqliteStore) -> Result<usize> {
    let mut users = Vec::new();
    for name in ["alice", "bob", "carol"] {
        let u = match store.user_by_username(name)? {
            Some(u) => u,
            None => store.create_user(name, Some(&format!("{} writes about software", name)), None)?,
        };
        users.push(u);
    }
    let [alice, bob, carol] = <[Author; 3]>::try_from(users).map_err(|_| anyhow!("seed users"))?;
    store.follow(&carol.id, &alice.id)?;
    store.follow(&bob.id, &alice.id)?;

    let posts: [(&Author, &str, &[&str]); 6] = [
        (&alice, "Cursor pagination done right", &["pagination", "api"]),
        (&bob, "Why we stopped using offsets", &["pagination"]),
        (&alice, "Tie breaking on timestamps", &["pagination", "sql"]),
        (&carol, "Notes on follow graphs", &["social"]),
        (&bob, "Favorites and counters", &["social", "sql"]),
        (&alice, "Relay connections explained", &["graphql", "api"]),
    ];
    let base = conduit_core::now_ms() - chrono::Duration::minutes(posts.len() as i64 * 10);
    let mut made = Vec::with_capacity(posts.len());
    for (i, (author, title, tags)) in posts.iter().enumerate() {
        let new = NewArticle {
            title: (*title).to_string(),
            description: format!("{} by {}", title, author.username),
            body: format!("# {}\n\nDemo body.", title),
            tags: tags.iter().map(|t| t.to_string()).collect(),
        };
        let at = base + chrono::Duration::minutes(i as i64 * 10);
        made.push(store.create_article_at(&author.id, new, at).with_context(|| format!("seeding '{}'", title))?);
    }
    store.favorite(&bob.id, &made[0].id)?;
    store.favorite(&carol.id, &made[0].id)?;
    store.favorite(&carol.id, &made[2].id)?;
    store.add_comment(&bob.id, &made[0].id, "Finally someone explains the extra row trick.")?;
    store.add_comment(&carol.id, &made[0].id, "What happens when two posts share a millisecond?")?;
    store.add_comment(&alice.id, &made[0].id, "The id breaks the tie.")?;
    Ok(made.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() { Cli::command().debug_assert(); }

    #[test]
    fn page_args_accept_negative_limit_for_validation() {
        let cli = Cli::try_parse_from(["conduitctl", "articles", "--limit", "-3", "--direction", "prev"]).unwrap();
        match cli.command {
            Commands::Articles { page, .. } => {
                assert_eq!(page.limit, Some(-3));
                assert_eq!(page.direction, Dir::Prev);
                let err = PageRequest::parse(Collection::Articles, None, page.limit.unwrap(), page.direction.into()).unwrap_err();
                assert!(err.is_client_error());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    fn mem_feeds() -> FeedService<SqliteStore> { FeedService::new(SqliteStore::open_in_memory().unwrap()) }

    #[test]
    fn writes_ignore_unknown_viewer() {
        let feeds = mem_feeds();
        let cli = Cli::try_parse_from(["conduitctl", "--as", "dave", "seed"]).unwrap();
        run(cli, &feeds).unwrap();
        let cli = Cli::try_parse_from(["conduitctl", "--as", "dave", "add-user", "erin"]).unwrap();
        run(cli, &feeds).unwrap();
        assert!(feeds.store().user_by_username("erin").unwrap().is_some());
    }

    #[test]
    fn reads_reject_unknown_viewer() {
        let feeds = mem_feeds();
        let cli = Cli::try_parse_from(["conduitctl", "--as", "dave", "articles"]).unwrap();
        let err = run(cli, &feeds).unwrap_err();
        assert!(err.to_string().contains("unknown user 'dave'"));
    }

    #[test]
    fn only_request_errors_map_to_bad_request_status() {
        assert_eq!(exit_status(&FeedError::InvalidPageRequest("x".into())), Some(EXIT_BAD_REQUEST));
        assert_eq!(exit_status(&FeedError::MalformedCursor(CursorError::Empty)), Some(2));
        assert_eq!(exit_status(&FeedError::DatastoreUnavailable(StoreError::Unavailable("down".into()))), None);
    }
}
