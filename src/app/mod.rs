//! The `joybor-sync` agent: one "tab" of the consistency layer running against the real backend.

mod event;

pub use event::{Event, EventHandler};

use clap::Subcommand;
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::{QueryCache, RestFetcher};
use crate::config::Config;
use crate::events::{DisabledChannel, EventBus, EventType, SharedChannel, SqliteChannel};
use crate::invalidation::{InvalidationReport, Invalidator, OperationCategory};

/// Commands the agent can run
#[derive(Debug, Clone, Subcommand)]
pub enum Command {
  /// Print the keys a category invalidates
  Keys {
    /// student, payment, application, settings, room or all
    category: String,
  },
  /// Invalidate a category against the backend
  Invalidate {
    /// student, payment, application, settings, room or all
    category: String,
  },
  /// Drop the whole cache and warm the critical views
  Clear,
  /// Announce a mutation to other instances
  Emit {
    /// e.g. student-updated
    event_type: String,
    /// JSON payload attached to the event
    #[arg(short, long)]
    data: Option<String>,
  },
  /// Follow other instances and invalidate on their events
  Watch,
}

/// Main application state
pub struct App {
  invalidator: Invalidator,
  bus: EventBus,
  /// Whether events reach other instances
  shared: bool,
}

impl App {
  pub fn new(config: Config) -> Result<Self> {
    let token = match Config::get_api_token() {
      Ok(token) => Some(token),
      Err(e) => {
        warn!("{}; requests are sent unauthenticated", e);
        None
      }
    };

    let fetcher = config.api.endpoints.iter().fold(
      RestFetcher::new(&config.api.url, token, config.timeout())?,
      |fetcher, (key, path)| fetcher.with_endpoint(key.clone(), path.clone()),
    );
    let cache = QueryCache::new(fetcher).with_stale_time(config.stale_time());
    let invalidator = Invalidator::new(Arc::new(cache))?;

    let (channel, shared) = open_channel(&config);
    let bus = EventBus::with_freshness(channel, config.freshness());

    Ok(Self {
      invalidator,
      bus,
      shared,
    })
  }

  pub async fn run(&mut self, command: Command) -> Result<()> {
    match command {
      Command::Keys { category } => {
        let category = category.parse::<OperationCategory>()?;
        print!("{}", render_keys(&self.invalidator, category));
      }
      Command::Invalidate { category } => {
        let category = category.parse::<OperationCategory>()?;
        let report = self.invalidator.invalidate(category).await;
        print!("{}", render_report(&report));
      }
      Command::Clear => {
        let report = self.invalidator.clear_all().await;
        print!("{}", render_report(&report));
      }
      Command::Emit { event_type, data } => {
        let event_type = event_type.parse::<EventType>()?;
        let data = data
          .map(|raw| serde_json::from_str::<Value>(&raw))
          .transpose()
          .map_err(|e| eyre!("Invalid --data JSON: {}", e))?;

        let event = self.bus.emit(event_type, data);
        if self.shared {
          println!("emitted {} at {}", event.event_type(), event.timestamp());
        } else {
          eprintln!(
            "shared channel unavailable; {} was not delivered to other instances",
            event_type
          );
        }
      }
      Command::Watch => self.watch().await?,
    }
    Ok(())
  }

  async fn watch(&mut self) -> Result<()> {
    let mut events = EventHandler::new();
    let invalidator = self.invalidator.clone().with_reporter(events.sender());

    let subscriptions: Vec<_> = EventType::ALL
      .iter()
      .map(|event_type| {
        let tx = events.sender();
        self.bus.subscribe(*event_type, move |event| {
          tx.send(Event::Domain(event.clone()))
            .map_err(|_| eyre!("watch loop stopped"))
        })
      })
      .collect();

    if !self.shared {
      eprintln!("shared channel unavailable; nothing to watch");
    }
    info!(bus = %self.bus.id(), "watching for events");

    while let Some(event) = events.next().await {
      match event {
        Event::Domain(event) => {
          let category = event.event_type().category();
          let report = invalidator.invalidate(category).await;
          println!("{} from another instance", event.event_type());
          print!("{}", render_report(&report));
        }
        Event::Notice(notice) => eprintln!("{}: {}", notice.title, notice.message),
        Event::Shutdown => break,
      }
    }

    for subscription in &subscriptions {
      subscription.unsubscribe();
      debug!(event_type = %subscription.event_type(), "unsubscribed");
    }
    self.bus.dispose();
    Ok(())
  }
}

/// Open the shared channel, falling back to tab-local delivery when it cannot be opened.
fn open_channel(config: &Config) -> (Arc<dyn SharedChannel>, bool) {
  let opened = config
    .channel_path()
    .and_then(|path| SqliteChannel::open(&path, &config.channel.slot, config.poll_interval()));

  match opened {
    Ok(channel) => (Arc::new(channel), true),
    Err(e) => {
      warn!("{:#}; events stay in this instance", e);
      (Arc::new(DisabledChannel), false)
    }
  }
}

fn join(resources: &[crate::resource::Resource]) -> String {
  resources
    .iter()
    .map(|r| r.as_str())
    .collect::<Vec<_>>()
    .join(", ")
}

fn render_keys(invalidator: &Invalidator, category: OperationCategory) -> String {
  let table = invalidator.table();
  format!(
    "{}: {}\ncritical: {}\n",
    category,
    join(table.keys(category)),
    join(&table.critical_keys(category)),
  )
}

fn render_report(report: &InvalidationReport) -> String {
  let mut out = String::new();
  match report.category {
    Some(category) => {
      let _ = writeln!(out, "invalidated {}: {}", category, join(&report.keys));
    }
    None => {
      let _ = writeln!(out, "cleared all entries");
    }
  }
  let _ = writeln!(out, "refetched: {}", join(&report.refetched));
  for failure in &report.failures {
    let _ = writeln!(out, "failed {} ({}): {}", failure.key, failure.stage, failure.error);
  }
  out
}
