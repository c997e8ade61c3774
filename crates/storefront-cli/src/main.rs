//! Storefront CLI - a command-line client for the storefront backend.
//!
//! Logs in, browses the catalog, manages the cart and places orders. Tokens
//! persist between runs and expired access tokens are refreshed on demand.

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use storefront_core::api::ApiError;
use storefront_core::auth::{
    FileTokenStore, KeyringTokenStore, MemoryTokenStore, NoticeLevel, SessionEvent,
};
use storefront_core::models::{CheckoutRequest, ProductQuery, RegisterForm};
use storefront_core::utils::{format_date, format_price, truncate_string};
use storefront_core::{
    ApiClient, AuthContext, CacheManager, CartStore, Config, SessionStore, TokenBackend, TokenStore,
};

const USAGE: &str = "\
Usage: storefront [--ephemeral] [--log-file PATH] <command> [args]

Commands:
  login [email]                     Log in (prompts for password)
  register                          Create an account
  logout                            Log out and forget stored tokens
  whoami                            Show the signed-in user
  products [--category ID] [--search Q]
  product <id>
  categories
  cart
  cart-add <product_id> [qty]
  cart-remove <item_id>
  cart-clear
  orders
  checkout <address_id> [notes]
  addresses";

/// Width of the name column in listings
const NAME_WIDTH: usize = 40;

/// Parsed command line
struct Args {
    ephemeral: bool,
    log_file: Option<PathBuf>,
    command: String,
    rest: Vec<String>,
}

impl Args {
    fn parse(mut raw: impl Iterator<Item = String>) -> Result<Self> {
        let mut ephemeral = false;
        let mut log_file = None;
        let mut positional = Vec::new();

        while let Some(arg) = raw.next() {
            match arg.as_str() {
                "--ephemeral" if positional.is_empty() => ephemeral = true,
                "--log-file" if positional.is_empty() => {
                    let path = raw.next().context("--log-file needs a path")?;
                    log_file = Some(PathBuf::from(path));
                }
                "-h" | "--help" if positional.is_empty() => positional.push("help".to_string()),
                _ => positional.push(arg),
            }
        }

        let mut positional = positional.into_iter();
        let command = positional.next().unwrap_or_else(|| "help".to_string());
        Ok(Self {
            ephemeral,
            log_file,
            command,
            rest: positional.collect(),
        })
    }

    /// Value following `--name` among the command arguments
    fn option(&self, name: &str) -> Option<&str> {
        self.rest
            .iter()
            .position(|a| a == name)
            .and_then(|i| self.rest.get(i + 1))
            .map(String::as_str)
    }

    fn positional(&self, index: usize) -> Option<&str> {
        self.rest.get(index).map(String::as_str)
    }

    fn required_id(&self, index: usize, what: &str) -> Result<i64> {
        let raw = self
            .positional(index)
            .with_context(|| format!("missing {}\n\n{}", what, USAGE))?;
        raw.parse()
            .with_context(|| format!("{} must be a number, got '{}'", what, raw))
    }
}

/// Initialize the tracing subscriber for logging.
/// The returned guard must live until exit so the log file is flushed.
fn init_tracing(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    // RUST_LOG controls the level (e.g., RUST_LOG=storefront_core=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    Ok(guard)
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::Notice(notice) => {
            let marker = match notice.level {
                NoticeLevel::Info => "i",
                NoticeLevel::Success => "✓",
                NoticeLevel::Error => "✗",
            };
            eprintln!("{} {}", marker, notice.message);
        }
        SessionEvent::SignedIn(user) => info!(user = %user.email, "Signed in"),
        SessionEvent::SignedOut(reason) => info!(?reason, "Signed out"),
        SessionEvent::RedirectToLogin { .. } => {
            eprintln!("Run `storefront login` to sign in again.");
        }
    }
}

fn open_token_store(config: &Config, ephemeral: bool) -> Result<Arc<dyn TokenStore>> {
    if ephemeral {
        return Ok(Arc::new(MemoryTokenStore::new()));
    }
    Ok(match config.token_backend {
        TokenBackend::File => Arc::new(FileTokenStore::open(&config.data_dir()?)?),
        TokenBackend::Keyring => Arc::new(KeyringTokenStore::open()?),
    })
}

fn prompt_line(label: &str) -> Result<String> {
    eprint!("{}: ", label);
    io::stderr().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

fn prompt_password(label: &str) -> Result<String> {
    rpassword::prompt_password(format!("{}: ", label)).context("Failed to read password")
}

/// Only a dead connection falls back to cached catalog data
fn is_offline(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<ApiError>(), Some(ApiError::NetworkError(_)))
}

struct App {
    config: Config,
    api: ApiClient,
    session: SessionStore,
    cart: Arc<CartStore>,
    cache: Option<CacheManager>,
}

impl App {
    fn new(config: Config, tokens: Arc<dyn TokenStore>) -> Result<Self> {
        let context = AuthContext::new(tokens);
        let api = ApiClient::with_timeout(
            &config.api_base_url,
            context,
            Duration::from_secs(config.request_timeout_secs),
        )?;
        let cache = match config.cache_dir().and_then(CacheManager::new) {
            Ok(cache) => Some(cache),
            Err(e) => {
                warn!(error = %e, "Catalog cache unavailable");
                None
            }
        };

        Ok(Self {
            session: SessionStore::new(api.clone()),
            cart: CartStore::new(api.clone()),
            api,
            cache,
            config,
        })
    }

    async fn run(&mut self, args: &Args) -> Result<()> {
        match args.command.as_str() {
            "login" => self.login(args.positional(0)).await,
            "register" => self.register().await,
            "logout" => {
                self.session.logout(true).await;
                Ok(())
            }
            "whoami" => self.whoami().await,
            "products" => {
                let category = match args.option("--category") {
                    Some(raw) => Some(raw.parse().context("--category must be a number")?),
                    None => None,
                };
                let query = ProductQuery {
                    category,
                    search: args.option("--search").map(str::to_string),
                    ..Default::default()
                };
                self.products(&query).await
            }
            "product" => self.product(args.required_id(0, "product id")?).await,
            "categories" => self.categories().await,
            "cart" => {
                self.cart.fetch().await;
                self.print_cart();
                Ok(())
            }
            "cart-add" => {
                let product_id = args.required_id(0, "product id")?;
                let quantity = match args.positional(1) {
                    Some(raw) => raw.parse().context("quantity must be a positive number")?,
                    None => 1,
                };
                if quantity == 0 {
                    bail!("quantity must be at least 1");
                }
                self.cart.add(product_id, quantity).await?;
                self.print_cart();
                Ok(())
            }
            "cart-remove" => {
                self.cart.remove(args.required_id(0, "cart item id")?).await?;
                self.print_cart();
                Ok(())
            }
            "cart-clear" => self.cart.clear().await,
            "orders" => self.orders().await,
            "checkout" => {
                let request = CheckoutRequest {
                    address_id: args.required_id(0, "address id")?,
                    notes: args.rest.get(1..).map(|n| n.join(" ")).unwrap_or_default(),
                };
                let order = self.cart.checkout(&request).await?;
                println!(
                    "Order {} placed: {} ({})",
                    order.order_number,
                    format_price(order.total),
                    order.status
                );
                Ok(())
            }
            "addresses" => self.addresses().await,
            "help" => {
                println!("{}", USAGE);
                Ok(())
            }
            other => bail!("unknown command '{}'\n\n{}", other, USAGE),
        }
    }

    async fn login(&mut self, email: Option<&str>) -> Result<()> {
        let email = match email.map(str::to_string).or_else(|| self.config.last_email.clone()) {
            Some(email) => email,
            None => prompt_line("Email")?,
        };
        let password = prompt_password("Password")?;

        let user = self.session.login(&email, &password).await?;
        println!("Logged in as {} <{}>", user.display_name(), user.email);

        self.config.last_email = Some(email);
        if let Err(e) = self.config.save() {
            warn!(error = %e, "Failed to save config");
        }
        Ok(())
    }

    async fn register(&mut self) -> Result<()> {
        let form = RegisterForm {
            username: prompt_line("Username")?,
            email: prompt_line("Email")?,
            first_name: prompt_line("First name")?,
            last_name: prompt_line("Last name")?,
            password: prompt_password("Password")?,
            confirm_password: prompt_password("Confirm password")?,
            ..Default::default()
        };

        let user = self.session.register(&form).await?;
        println!("Registered and logged in as {}", user.email);

        self.config.last_email = Some(user.email);
        if let Err(e) = self.config.save() {
            warn!(error = %e, "Failed to save config");
        }
        Ok(())
    }

    async fn whoami(&self) -> Result<()> {
        if !self.session.init().await {
            println!("Not logged in");
            return Ok(());
        }
        if let Some(user) = self.session.state().user {
            println!("{} <{}>", user.display_name(), user.email);
            if let Some(phone) = user.phone_number.filter(|p| !p.is_empty()) {
                println!("Phone: {}", phone);
            }
        }
        Ok(())
    }

    async fn products(&self, query: &ProductQuery) -> Result<()> {
        let products = match self.api.list_products(query).await {
            Ok(listing) => {
                let total = listing.total_count();
                let products = listing.into_items();
                // Search results are not a stable view of the category
                if query.search.is_none() {
                    if let Some(cache) = &self.cache {
                        if let Err(e) = cache.save_products(query.category, &products) {
                            warn!(error = %e, "Failed to cache products");
                        }
                    }
                }
                if total > products.len() {
                    eprintln!("Showing {} of {} products", products.len(), total);
                }
                products
            }
            Err(e) if is_offline(&e) => {
                let cached = self
                    .cache
                    .as_ref()
                    .and_then(|cache| cache.load_products(query.category).ok().flatten());
                match cached {
                    Some(cached) => {
                        eprintln!("Offline, showing products cached {}", cached.age_display());
                        cached.data
                    }
                    None => return Err(e),
                }
            }
            Err(e) => return Err(e),
        };

        if products.is_empty() {
            println!("No products found");
        }
        for product in &products {
            println!(
                "{:>5}  {:<width$}  {:>12}  {}",
                product.id,
                truncate_string(&product.name, NAME_WIDTH),
                format_price(product.effective_price()),
                if product.in_stock() { "" } else { "out of stock" },
                width = NAME_WIDTH
            );
        }
        Ok(())
    }

    async fn product(&self, id: i64) -> Result<()> {
        let product = self.api.product(id).await?;
        println!("{} (#{})", product.name, product.id);
        if let Some(category) = &product.category_name {
            println!("Category: {}", category);
        }
        let price = product.effective_price();
        if price < product.price {
            println!("Price: {} (was {})", format_price(price), format_price(product.price));
        } else {
            println!("Price: {}", format_price(price));
        }
        println!("Stock: {}", if product.in_stock() { "in stock" } else { "out of stock" });
        if !product.description.is_empty() {
            println!("\n{}", product.description);
        }
        Ok(())
    }

    async fn categories(&self) -> Result<()> {
        let categories = match self.api.list_categories().await {
            Ok(listing) => {
                let categories = listing.into_items();
                if let Some(cache) = &self.cache {
                    if let Err(e) = cache.save_categories(&categories) {
                        warn!(error = %e, "Failed to cache categories");
                    }
                }
                categories
            }
            Err(e) if is_offline(&e) => {
                let cached = self
                    .cache
                    .as_ref()
                    .and_then(|cache| cache.load_categories().ok().flatten());
                match cached {
                    Some(cached) => {
                        eprintln!("Offline, showing categories cached {}", cached.age_display());
                        cached.data
                    }
                    None => return Err(e),
                }
            }
            Err(e) => return Err(e),
        };

        for category in &categories {
            println!("{:>5}  {}", category.id, category.name);
        }
        Ok(())
    }

    fn print_cart(&self) {
        let items = self.cart.items();
        if items.is_empty() {
            println!("Your cart is empty");
            return;
        }
        for item in &items {
            println!(
                "{:>5}  {:<width$}  {:>3} x {:>10}  {:>12}",
                item.id,
                truncate_string(&item.product_name, NAME_WIDTH),
                item.quantity,
                format_price(item.unit_price),
                format_price(item.item_total),
                width = NAME_WIDTH
            );
        }
        println!(
            "{} items, subtotal {}, total {}",
            self.cart.total_items(),
            format_price(self.cart.subtotal()),
            format_price(self.cart.total_price())
        );
    }

    async fn orders(&self) -> Result<()> {
        let orders = self.api.list_orders().await?.into_items();
        if orders.is_empty() {
            println!("No orders yet");
        }
        for order in &orders {
            println!(
                "{:<16}  {:<13}  {:>12}  {}",
                order.order_number,
                format_date(order.created_at.as_ref()),
                format_price(order.total),
                order.status
            );
        }
        Ok(())
    }

    async fn addresses(&self) -> Result<()> {
        let addresses = self.api.list_addresses().await?.into_items();
        if addresses.is_empty() {
            println!("No saved addresses");
        }
        for address in &addresses {
            let marker = if address.is_default { "*" } else { " " };
            println!("{:>5} {} {}", address.id, marker, address.one_line());
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let args = Args::parse(std::env::args().skip(1))?;
    let _log_guard = init_tracing(args.log_file.as_deref())?;
    info!(command = %args.command, "storefront starting");

    let config = Config::load()?;
    let tokens = open_token_store(&config, args.ephemeral)?;
    let mut app = App::new(config, tokens)?;

    let mut events: broadcast::Receiver<SessionEvent> = app.api.context().subscribe();
    let result = {
        let command = app.run(&args);
        tokio::pin!(command);
        loop {
            tokio::select! {
                result = &mut command => break result,
                Ok(event) = events.recv() => print_event(&event),
            }
        }
    };
    while let Ok(event) = events.try_recv() {
        print_event(&event);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::parse(args.iter().map(|s| s.to_string())).unwrap()
    }

    #[test]
    fn test_parse_globals_and_command() {
        let args = parse(&["--ephemeral", "--log-file", "/tmp/sf.log", "cart-add", "4", "2"]);
        assert!(args.ephemeral);
        assert_eq!(args.log_file, Some(PathBuf::from("/tmp/sf.log")));
        assert_eq!(args.command, "cart-add");
        assert_eq!(args.required_id(0, "product id").unwrap(), 4);
        assert_eq!(args.positional(1), Some("2"));
    }

    #[test]
    fn test_parse_options() {
        let args = parse(&["products", "--category", "3", "--search", "kurta"]);
        assert!(!args.ephemeral);
        assert_eq!(args.option("--category"), Some("3"));
        assert_eq!(args.option("--search"), Some("kurta"));
        assert_eq!(args.option("--missing"), None);
    }

    #[test]
    fn test_parse_defaults_to_help() {
        assert_eq!(parse(&[]).command, "help");
        assert_eq!(parse(&["--help"]).command, "help");
    }

    #[test]
    fn test_required_id_errors() {
        let args = parse(&["product", "abc"]);
        assert!(args.required_id(0, "product id").is_err());
        assert!(args.required_id(1, "product id").is_err());
    }

    #[test]
    fn test_log_file_needs_path() {
        assert!(Args::parse(["--log-file".to_string()].into_iter()).is_err());
    }
}
