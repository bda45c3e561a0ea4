#![deny(missing_docs)]

//! DDC/CI monitor control.
//!
//! Discovers the monitors attached to a machine, learns each one's protocol
//! quirks, and exposes get/set access to their VCP features with bounded
//! retry and per-display adaptive timing.
//!
//! # Example
//!
//! ```rust,no_run
//! use ddcci::{Context, Query};
//!
//! let ctx = Context::new("").unwrap();
//! for rec in ctx.displays() {
//!     println!("{}", rec.display);
//! }
//! let mut handle = ctx.open_display(&Query::DisplayNumber(1), None).unwrap();
//! let brightness = handle.get_vcp_feature(0x10).unwrap();
//! println!("brightness {} of {}", brightness.value(), brightness.maximum());
//! ```

pub mod caps;
pub mod config;
pub mod discovery;
pub mod display;
pub mod display_info;
pub mod error;
#[cfg(target_os = "linux")]
pub mod i2c;
pub mod packet;
pub mod query;
pub mod retry;
pub mod sleep;
pub mod state;
pub mod stats;
pub mod transport;
pub mod vcp;

pub use crate::{
    caps::Capabilities,
    config::Options,
    display::{DdcFlags, Display, DisplayHandle, DisplayRec, IoPath},
    display_info::DisplayInfo,
    error::{last_error_detail, DdcResult, Error, Status},
    query::Query,
    retry::{CancelToken, TryClass, TryPolicy, MAX_MAX_TRIES},
    sleep::{DynamicSleep, SleepEvent},
    stats::Stats,
    transport::DdcTransport,
    vcp::{FeatureCode, TimingReport, VcpValue},
};
use {
    crate::{
        discovery::{NoUsb, UsbEnumerator, DEFAULT_ASYNC_THRESHOLD},
        error::set_last_error,
        state::{CapabilitiesCache, DisplaysCache, DisplayTuning, DsaStats, StateStore},
    },
    log::{debug, warn},
    std::{
        sync::{Arc, Mutex},
        time::{Duration, Instant},
    },
};

/// An initialized library context: discovered displays, retry policy,
/// statistics and persisted state.
///
/// All operations go through a context value; the process-wide
/// [`initialize`]/[`teardown`] pair is a thin adapter over a default
/// context.
pub struct Context {
    options: Options,
    policy: TryPolicy,
    stats: Arc<Stats>,
    displays: Vec<DisplayRec>,
    state_store: StateStore,
    usb: Box<dyn UsbEnumerator>,
    caps_cache: Mutex<CapabilitiesCache>,
}

impl Context {
    /// Initialize from the configuration file plus a caller-supplied
    /// options string (the caller's options win).
    pub fn new(options_str: &str) -> DdcResult<Self> {
        let mut options = match config::default_config_path() {
            Some(path) => config::load_config_file(&path)?,
            None => Options::default(),
        };
        options.apply_str(options_str, Status::InvalidArgument)?;
        Self::with_options(options, Box::new(NoUsb))
    }

    /// Initialize from explicit options and a USB enumeration seam.
    pub fn with_options(options: Options, usb: Box<dyn UsbEnumerator>) -> DdcResult<Self> {
        let started = Instant::now();
        let policy = options.try_policy();
        let stats = Arc::new(Stats::default());
        let state_store = if options.displays_cache {
            StateStore::new()
        } else {
            StateStore::disabled()
        };

        let mut displays = scan_platform_candidates(&options);
        if options.enable_usb {
            displays.extend(discovery::usb_candidates(usb.as_ref()));
        }

        // seed tuning from the displays cache before any traffic happens
        let cache = state_store.load_displays().unwrap_or_else(|e| {
            warn!("ignoring displays cache: {}", e);
            DisplaysCache::default()
        });
        for rec in &displays {
            let mut state = rec.lock();
            if let Some(tuning) = rec.display.info.id_key().and_then(|k| cache.displays.get(&k)) {
                debug!("{}: seeding sleep multiplier {}", rec.display.path, tuning.sleep_multiplier);
                state.tuning = DynamicSleep::with_multiplier(tuning.sleep_multiplier);
            }
            if let Some(multiplier) = options.sleep_multiplier {
                state.tuning.set_user_multiplier(multiplier);
            }
            if !options.dynamic_sleep {
                state.tuning.freeze();
            }
        }

        discovery::check_and_number(
            &mut displays,
            DEFAULT_ASYNC_THRESHOLD,
            &policy,
            &stats,
            |path| open_transport_on(path, usb.as_ref()),
        );
        discovery::filter_phantoms(&mut displays, connector_attrs);

        let caps_cache = if options.capabilities_cache {
            state_store.load_capabilities().unwrap_or_else(|e| {
                warn!("ignoring capabilities cache: {}", e);
                CapabilitiesCache::default()
            })
        } else {
            CapabilitiesCache::default()
        };

        let ctx = Context {
            options,
            policy,
            stats,
            displays,
            state_store,
            usb,
            caps_cache: Mutex::new(caps_cache),
        };
        ctx.stats.profile_call("Context::new", started.elapsed());
        debug!(
            "discovery found {} display(s) in {:?}",
            ctx.displays.iter().filter(|r| r.display.dispno > 0).count(),
            started.elapsed(),
        );
        Ok(ctx)
    }

    /// Every display reference discovery produced, phantoms and failures
    /// included.
    pub fn displays(&self) -> &[DisplayRec] {
        &self.displays
    }

    /// The effective options.
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Execution statistics.
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Find the working display matching a query.
    pub fn find_display(&self, query: &Query) -> DdcResult<&DisplayRec> {
        let res = self.find_display_inner(query);
        marshal(res)
    }

    fn find_display_inner(&self, query: &Query) -> DdcResult<&DisplayRec> {
        const SITE: &str = "context::find_display";
        if let Some(rec) = self
            .displays
            .iter()
            .find(|r| r.display.dispno > 0 && query.matches(&r.display))
        {
            return Ok(rec);
        }
        // a query matching only unusable references reports why
        if let Some(rec) = self.displays.iter().find(|r| query.matches(&r.display)) {
            let flags = rec.flags();
            let status = if flags.contains(DdcFlags::REMOVED) {
                Status::DisplayRemoved
            } else if flags.contains(DdcFlags::BUSY) {
                Status::DisplayBusy
            } else {
                Status::DisplayNotFound
            };
            return Err(Error::new(status, SITE, rec.display.to_string()));
        }
        Err(Error::status(Status::DisplayNotFound, SITE))
    }

    /// Open a handle on the display matching a query.
    ///
    /// `timeout` bounds the display-lock acquisition; expiry reports
    /// `display-busy` instead of waiting.
    pub fn open_display(&self, query: &Query, timeout: Option<Duration>) -> DdcResult<DisplayHandle<'_>> {
        let started = Instant::now();
        let res = self.open_display_inner(query, timeout);
        self.stats.profile_call("Context::open_display", started.elapsed());
        marshal(res)
    }

    fn open_display_inner(
        &self,
        query: &Query,
        timeout: Option<Duration>,
    ) -> DdcResult<DisplayHandle<'_>> {
        let rec = self.find_display_inner(query)?;
        let transport = open_transport_on(&rec.display.path, self.usb.as_ref())?;
        let mut handle = DisplayHandle::open(rec, transport, self.policy, self.stats.clone(), timeout)?;
        let state = &mut *handle.state;
        discovery::reprobe_dialect_if_flaky(
            handle.transport.as_mut(),
            state,
            &self.policy,
            &self.stats,
            &handle.cancel,
        );
        Ok(handle)
    }

    /// The display's capabilities string, consulting the persisted cache.
    pub fn capabilities_string(&self, handle: &mut DisplayHandle) -> DdcResult<Vec<u8>> {
        let res = self.capabilities_string_inner(handle);
        marshal(res)
    }

    fn capabilities_string_inner(&self, handle: &mut DisplayHandle) -> DdcResult<Vec<u8>> {
        let key = handle.display().info.id_key();
        if self.options.capabilities_cache {
            if let Some(key) = &key {
                let cache = self.caps_cache.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(cached) = cache.capabilities.get(key) {
                    debug!("capabilities for {} served from cache", key);
                    return Ok(cached.clone().into_bytes());
                }
            }
        }
        let raw = handle.capabilities_string()?;
        if let Some(key) = key {
            let mut cache = self.caps_cache.lock().unwrap_or_else(|e| e.into_inner());
            cache
                .capabilities
                .insert(key, String::from_utf8_lossy(&raw).into_owned());
        }
        Ok(raw)
    }

    /// Persist tuning state and shut the context down.
    ///
    /// State files are written under a process-wide teardown lock.
    pub fn teardown(self) -> DdcResult<()> {
        static TEARDOWN: Mutex<()> = Mutex::new(());
        let _guard = TEARDOWN.lock().unwrap_or_else(|e| e.into_inner());

        let mut displays = DisplaysCache::default();
        let mut dsa = DsaStats::default();
        for rec in &self.displays {
            let Some(key) = rec.display.info.id_key() else {
                continue;
            };
            // phantoms share their identity with a live display; skip them
            if rec.display.dispno == display::DISPNO_PHANTOM {
                continue;
            }
            let state = rec.lock();
            let snapshot = state.tuning.snapshot();
            displays.displays.insert(
                key.clone(),
                DisplayTuning {
                    sleep_multiplier: snapshot.multiplier,
                },
            );
            dsa.displays.insert(key, snapshot);
        }

        let res = (|| {
            if self.options.displays_cache {
                self.state_store.save_displays(&displays)?;
                self.state_store.save_dsa(&dsa)?;
            }
            if self.options.capabilities_cache {
                let caps = self.caps_cache.lock().unwrap_or_else(|e| e.into_inner());
                self.state_store.save_capabilities(&caps)?;
            }
            Ok(())
        })();
        marshal(res)
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("displays", &self.displays)
            .field("options", &self.options)
            .finish()
    }
}

/// Record an error in the thread-local detail slot on its way out.
fn marshal<T>(res: DdcResult<T>) -> DdcResult<T> {
    if let Err(err) = &res {
        set_last_error(err);
    }
    res
}

#[cfg(target_os = "linux")]
fn scan_platform_candidates(options: &Options) -> Vec<DisplayRec> {
    discovery::linux::scan_candidates(options.edid_read_size)
}

#[cfg(not(target_os = "linux"))]
fn scan_platform_candidates(_options: &Options) -> Vec<DisplayRec> {
    Vec::new()
}

fn open_transport_on(
    path: &IoPath,
    usb: &dyn UsbEnumerator,
) -> DdcResult<Box<dyn DdcTransport + Send>> {
    match *path {
        #[cfg(target_os = "linux")]
        IoPath::I2c { bus } => Ok(Box::new(i2c::I2cBus::open(bus)?)),
        #[cfg(not(target_os = "linux"))]
        IoPath::I2c { bus } => Err(Error::new(
            Status::UnsupportedOp,
            "context::open_transport",
            format!("i2c-{} requires Linux i2c-dev", bus),
        )),
        IoPath::Usb { bus, device } => usb.open(bus, device),
    }
}

#[cfg(target_os = "linux")]
fn connector_attrs(path: &IoPath) -> Option<discovery::ConnectorAttrs> {
    discovery::linux::connector_attrs(path)
}

#[cfg(not(target_os = "linux"))]
fn connector_attrs(_path: &IoPath) -> Option<discovery::ConnectorAttrs> {
    None
}

static GLOBAL: Mutex<Option<Context>> = Mutex::new(None);

/// Initialize the process-wide default context.
///
/// A second initialization without an intervening [`teardown`] fails with
/// `invalid-operation`.
pub fn initialize(options_str: &str) -> DdcResult<()> {
    let mut global = GLOBAL.lock().unwrap_or_else(|e| e.into_inner());
    if global.is_some() {
        return marshal(Err(Error::new(
            Status::InvalidOperation,
            "facade::initialize",
            "library already initialized",
        )));
    }
    *global = Some(Context::new(options_str)?);
    Ok(())
}

/// Run an operation against the process-wide default context.
pub fn with_context<T>(f: impl FnOnce(&Context) -> DdcResult<T>) -> DdcResult<T> {
    let global = GLOBAL.lock().unwrap_or_else(|e| e.into_inner());
    match global.as_ref() {
        Some(ctx) => f(ctx),
        None => marshal(Err(Error::new(
            Status::InvalidOperation,
            "facade::with_context",
            "library not initialized",
        ))),
    }
}

/// Tear down the process-wide default context, persisting state.
pub fn teardown() -> DdcResult<()> {
    let ctx = GLOBAL
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .take()
        .ok_or_else(|| {
            Error::new(
                Status::InvalidOperation,
                "facade::teardown",
                "library not initialized",
            )
        });
    marshal(ctx)?.teardown()
}
