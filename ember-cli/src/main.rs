//! Demo assembly of the ember engine: CLI flags, logging, the in-memory
//! user store, the legacy login/register routes, and the server itself.

use std::collections::HashMap;
use std::env;
use std::error::Error;
use std::sync::{Arc, Mutex};

use clap::Parser;
use ember::{
    ConcurrencyMode, FileLogger, HttpRequest, HttpResponse, MemoryStore, Router, Server,
    ServerConfig, StorePool, UserStore,
};

/// Event-driven HTTP/1.1 application server.
#[derive(Parser)]
#[command(name = "ember", version, about)]
struct Cli {
    /// Listening port
    #[arg(short = 'p', default_value_t = 9906)]
    port: u16,

    /// Log mode: 0 synchronous, 1 asynchronous
    #[arg(short = 'l', default_value_t = 0)]
    log_mode: u8,

    /// Trigger mode 0-3: listener,connection in {LT,ET}^2
    #[arg(short = 'm', default_value_t = 0)]
    trigger_mode: u8,

    /// SO_LINGER on the listener: 0 off, 1 on
    #[arg(short = 'o', default_value_t = 0)]
    opt_linger: u8,

    /// Database handle pool size
    #[arg(short = 's', default_value_t = 8)]
    store_size: usize,

    /// Worker thread count
    #[arg(short = 't', default_value_t = 8)]
    threads: usize,

    /// Disable logging: 0 enabled, 1 disabled
    #[arg(short = 'c', default_value_t = 0)]
    close_log: u8,

    /// Concurrency mode: 0 Proactor, 1 Reactor
    #[arg(short = 'a', default_value_t = 0)]
    actor_mode: u8,
}

type Cache = Arc<Mutex<HashMap<String, String>>>;

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();

    let mut cfg = ServerConfig::default();
    cfg.port = cli.port;
    cfg.log_async = cli.log_mode != 0;
    cfg.trigger_mode = cli.trigger_mode;
    cfg.opt_linger = cli.opt_linger != 0;
    cfg.store_size = cli.store_size;
    cfg.thread_num = cli.threads;
    cfg.close_log = cli.close_log != 0;
    cfg.mode = if cli.actor_mode != 0 {
        ConcurrencyMode::Reactor
    } else {
        ConcurrencyMode::Proactor
    };

    if !cfg.close_log {
        let queue_size = if cfg.log_async { cfg.log_queue_size } else { 0 };
        FileLogger::init(&cfg.log_path, cfg.log_split_lines, queue_size)?;
    }

    // Credentials a real driver would use; the in-memory backend only
    // needs them logged for parity.
    let db_user = env::var("DB_USER").unwrap_or_default();
    let db_name = env::var("DB_NAME").unwrap_or_default();
    let _db_password = env::var("DB_PASSWORD").unwrap_or_default();
    log::info!("user store: {}@{} (in-memory backend)", db_user, db_name);

    let table: Cache = Arc::new(Mutex::new(HashMap::new()));
    let stores = StorePool::open(cfg.store_size, || {
        Ok(Box::new(MemoryStore::shared(Arc::clone(&table))) as Box<dyn UserStore>)
    })?;

    // Startup snapshot of the user table, consulted by the login route.
    let cache: Cache = {
        let mut guard = stores.acquire();
        let users = guard.store().load_users()?;
        Arc::new(Mutex::new(users.into_iter().collect()))
    };

    let router = Arc::new(Router::new());
    register_routes(&router, cache);

    let mut server = Server::new(cfg, router, stores)?;
    println!("Server started..");
    server.run()?;
    Ok(())
}

fn register_routes(router: &Router, cache: Cache) {
    let login_cache = Arc::clone(&cache);
    router.post(
        "/2CGISQL.cgi",
        move |req: &HttpRequest, res: &mut HttpResponse, _store: &mut dyn UserStore| {
            let user = req.form_value("user").unwrap_or_default();
            let passwd = req.form_value("passwd").unwrap_or_default();
            let known = login_cache
                .lock()
                .map(|users| users.get(user).map(String::as_str) == Some(passwd))
                .unwrap_or(false);
            let page = if known { "/welcome.html" } else { "/logError.html" };
            let _ = res.render(200, page);
        },
    );

    let register_cache = cache;
    router.post(
        "/3CGISQL.cgi",
        move |req: &HttpRequest, res: &mut HttpResponse, store: &mut dyn UserStore| {
            let user = req.form_value("user").unwrap_or_default().to_string();
            let passwd = req.form_value("passwd").unwrap_or_default().to_string();
            let taken = register_cache
                .lock()
                .map(|users| users.contains_key(&user))
                .unwrap_or(true);
            let mut page = "/registerError.html";
            if !user.is_empty() && !taken {
                if let Ok(true) = store.insert_user(&user, &passwd) {
                    if let Ok(mut users) = register_cache.lock() {
                        users.insert(user, passwd);
                    }
                    page = "/log.html";
                }
            }
            let _ = res.render(200, page);
        },
    );
}
