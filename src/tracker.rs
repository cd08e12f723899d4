use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use percent_encoding::{percent_encode, NON_ALPHANUMERIC};
use rand::seq::SliceRandom;
use reqwest::{Client, ClientBuilder};
use tokio::sync::watch;
use tokio::time::{sleep_until, timeout, Instant};
use url::Url;

use crate::bencoding::Value;
use crate::manager::torrent_manager::TorrentManager;

pub const RETRY: Duration = Duration::from_secs(300); // wait before contacting a failed tracker again
const MIN_FORCED_INTERVAL: Duration = Duration::from_secs(60);
const STOPPED_TIMEOUT: Duration = Duration::from_secs(5);
const NUMWANT: u32 = 50;
const COMPACT: i32 = 1;

#[derive(PartialEq, Debug, Clone)]
pub struct Peer {
    pub peer_id: Option<String>,
    pub ip: String, // IPv6, IPv4 or DNS name
    pub port: u16,
}

impl Peer {
    /// The address to connect to, when the tracker gave an ip literal.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.ip
            .parse::<IpAddr>()
            .ok()
            .map(|ip| SocketAddr::new(ip, self.port))
    }
}

#[derive(PartialEq, Debug)]
pub struct OkResponse {
    pub warning_message: Option<String>,
    pub interval: u64,
    pub min_interval: Option<u64>,
    pub tracker_id: Option<String>,
    pub complete: i64,   // seeders
    pub incomplete: i64, // leechers
    pub peers: Vec<Peer>,
}

#[derive(PartialEq, Debug)]
pub enum Response {
    Ok(OkResponse),
    Failure(String),
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Response::Ok(ok) => {
                if let Some(warning_message) = &ok.warning_message {
                    write!(f, "WARNING {warning_message}; ")?;
                }
                write!(
                    f,
                    "interval: {}, min_interval: {:?}, tracker_id: {:?}, seeders: {}, leechers: {}, peers: {}",
                    ok.interval,
                    ok.min_interval,
                    ok.tracker_id,
                    ok.complete,
                    ok.incomplete,
                    ok.peers.len()
                )
            }
            Response::Failure(failure_message) => write!(f, "FAILURE: {failure_message}"),
        }
    }
}

#[derive(PartialEq, Debug, Clone, Copy)]
pub enum Event {
    None,
    Started,
    Stopped,
    Completed,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Event::None => "",
            Event::Started => "started",
            Event::Stopped => "stopped",
            Event::Completed => "completed",
        };
        write!(f, "{s}")
    }
}

/// Transfer counters reported to trackers, updated by the download core.
#[derive(Debug, Default)]
pub struct TransferStats {
    uploaded: AtomicU64,
    downloaded: AtomicU64,
    left: AtomicU64,
}

impl TransferStats {
    pub fn new(left: u64) -> Self {
        TransferStats {
            left: AtomicU64::new(left),
            ..Default::default()
        }
    }

    pub fn update_uploaded(&self, bytes: u64) {
        self.uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn update_downloaded(&self, bytes: u64) {
        self.downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn update_left(&self, bytes: u64) {
        let _ = self
            .left
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |l| {
                Some(l.saturating_sub(bytes))
            });
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    pub fn left(&self) -> u64 {
        self.left.load(Ordering::Relaxed)
    }
}

struct Tracker {
    url: String,
    next_contact: Option<Instant>,
}

pub struct TrackerClient {
    http: Client,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    listening_port: u16,
    tracker_id: Option<String>,
    tiers: Vec<Vec<Tracker>>,
}

impl TrackerClient {
    pub fn new(
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        announce_list: &[Vec<String>],
        listening_port: u16,
    ) -> Result<Self> {
        let mut rng = rand::rng();
        let tiers = announce_list
            .iter()
            .map(|tier| {
                let mut tier: Vec<Tracker> = tier
                    .iter()
                    .filter(|url| url.starts_with("http"))
                    .map(|url| Tracker {
                        url: url.clone(),
                        next_contact: None,
                    })
                    .collect();
                tier.shuffle(&mut rng);
                tier
            })
            .filter(|tier| !tier.is_empty())
            .collect::<Vec<_>>();
        if tiers.is_empty() {
            log::warn!("no http tracker in announce list, we will only accept incoming peers");
        }
        let http = ClientBuilder::new()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(TrackerClient {
            http,
            info_hash,
            peer_id,
            listening_port,
            tracker_id: None,
            tiers,
        })
    }

    /// Earliest instant at which some tracker may be contacted again.
    pub fn next_contact(&self) -> Option<Instant> {
        self.tiers
            .iter()
            .flatten()
            .map(|t| t.next_contact.unwrap_or_else(Instant::now))
            .min()
    }

    pub fn urls(&self) -> Vec<Vec<String>> {
        self.tiers
            .iter()
            .map(|tier| tier.iter().map(|t| t.url.clone()).collect())
            .collect()
    }

    /// Walks the tiers in order until a tracker answers. Trackers whose
    /// deadline has not passed are skipped unless `force` is set. The tracker
    /// that answers is moved to the front of its tier.
    pub async fn announce(
        &mut self,
        stats: &TransferStats,
        event: Event,
        force: bool,
    ) -> Result<OkResponse> {
        let mut errors = Vec::new();
        for tier_idx in 0..self.tiers.len() {
            for tracker_idx in 0..self.tiers[tier_idx].len() {
                let now = Instant::now();
                let tracker = &self.tiers[tier_idx][tracker_idx];
                if !force && tracker.next_contact.is_some_and(|n| n > now) {
                    continue;
                }
                let url = tracker.url.clone();
                log::debug!("trying reaching http tracker {url}...");
                let result = match self.announce_url(&url, stats, event) {
                    Ok(u) => self.request(u).await,
                    Err(e) => Err(e),
                };
                match result {
                    Ok(Response::Ok(response)) => {
                        if let Some(id) = &response.tracker_id {
                            self.tracker_id = Some(id.clone());
                        }
                        let interval = Duration::from_secs(
                            response
                                .interval
                                .max(response.min_interval.unwrap_or(0))
                                .max(1),
                        );
                        let mut tracker = self.tiers[tier_idx].remove(tracker_idx);
                        tracker.next_contact = Some(Instant::now() + interval);
                        self.tiers[tier_idx].insert(0, tracker);
                        return Ok(response);
                    }
                    Ok(Response::Failure(msg)) => {
                        log::debug!("tracker {url} responded with failure: {msg}");
                        errors.push(format!("tracker {url} failed: \"{msg}\""));
                    }
                    Err(e) => {
                        log::debug!("error from tracker {url}: {e:#}");
                        errors.push(format!("tracker {url} errored: \"{e:#}\""));
                    }
                }
                self.tiers[tier_idx][tracker_idx].next_contact = Some(Instant::now() + RETRY);
            }
        }
        if errors.is_empty() {
            bail!("no tracker to contact");
        }
        Err(anyhow!(errors.join("; ")))
    }

    fn announce_url(&self, base: &str, stats: &TransferStats, event: Event) -> Result<Url> {
        let mut url = Url::parse(base).with_context(|| format!("invalid tracker url {base}"))?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("port", &self.listening_port.to_string())
                .append_pair("uploaded", &stats.uploaded().to_string())
                .append_pair("downloaded", &stats.downloaded().to_string())
                .append_pair("left", &stats.left().to_string())
                .append_pair("compact", &COMPACT.to_string())
                .append_pair("numwant", &NUMWANT.to_string());
            if event != Event::None {
                query.append_pair("event", &event.to_string());
            }
            if let Some(id) = &self.tracker_id {
                query.append_pair("trackerid", id);
            }
        }

        // binary values are encoded by hand, the url crate would encode them again
        let binary = format!(
            "info_hash={}&peer_id={}",
            percent_encode(&self.info_hash, NON_ALPHANUMERIC),
            percent_encode(&self.peer_id, NON_ALPHANUMERIC)
        );
        let query = match url.query() {
            Some(q) if !q.is_empty() => format!("{binary}&{q}"),
            _ => binary,
        };
        url.set_query(Some(&query));
        Ok(url)
    }

    async fn request(&self, url: Url) -> Result<Response> {
        log::trace!("requesting url: {url}");
        let body = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        parse_response(&body)
    }
}

pub fn parse_response(body: &[u8]) -> Result<Response> {
    let response = Value::decode(body).context("tracker response is not valid bencoding")?;
    let Value::Dict(map, _, _) = &response else {
        bail!("tracker response was not a bencoded dict");
    };

    if let Some(reason) = map.get(b"failure reason".as_slice()) {
        return Ok(Response::Failure(utf8_str(reason, "failure reason")?));
    }

    let warning_message = map
        .get(b"warning message".as_slice())
        .map(|w| utf8_str(w, "warning message"))
        .transpose()?;
    let interval = match map.get(b"interval".as_slice()) {
        Some(Value::Int(i)) if *i >= 0 => *i as u64,
        _ => bail!("interval missing from tracker response or not a positive number"),
    };
    let min_interval = match map.get(b"min interval".as_slice()) {
        Some(Value::Int(i)) if *i >= 0 => Some(*i as u64),
        _ => None,
    };
    let tracker_id = map
        .get(b"tracker id".as_slice())
        .map(|t| utf8_str(t, "tracker id"))
        .transpose()?;
    // some trackers omit the swarm counters
    let complete = match map.get(b"complete".as_slice()) {
        Some(Value::Int(i)) => *i,
        _ => 0,
    };
    let incomplete = match map.get(b"incomplete".as_slice()) {
        Some(Value::Int(i)) => *i,
        _ => 0,
    };
    let peers = match map.get(b"peers".as_slice()) {
        Some(Value::List(peers)) => peers_from_dicts(peers)?,
        Some(Value::Str(peers)) => peers_from_compact(peers)?,
        _ => bail!("peers missing from tracker response or neither a list nor a string"),
    };

    Ok(Response::Ok(OkResponse {
        warning_message,
        interval,
        min_interval,
        tracker_id,
        complete,
        incomplete,
        peers,
    }))
}

fn utf8_str(value: &Value, key: &str) -> Result<String> {
    match value {
        Value::Str(s) => Ok(str::from_utf8(s)
            .with_context(|| format!("{key} in tracker response is not utf-8"))?
            .to_string()),
        _ => bail!("{key} in tracker response is not a string"),
    }
}

fn peers_from_dicts(peers: &[Value]) -> Result<Vec<Peer>> {
    let mut list = Vec::with_capacity(peers.len());
    for peer in peers {
        let peer_id = match peer.get(b"peer id") {
            Some(Value::Str(id)) => Some(crate::util::force_string(id)),
            _ => None,
        };
        let ip = match peer.get(b"ip") {
            Some(ip) => utf8_str(ip, "peer ip")?,
            None => bail!("peer entry without ip in tracker response"),
        };
        let port = match peer.get(b"port") {
            Some(Value::Int(p)) => u16::try_from(*p).context("peer port out of range")?,
            _ => bail!("peer entry without port in tracker response"),
        };
        list.push(Peer { peer_id, ip, port });
    }
    Ok(list)
}

fn peers_from_compact(peers: &[u8]) -> Result<Vec<Peer>> {
    if peers.len() % 6 != 0 {
        bail!(
            "compact peers list of {} bytes is not a multiple of 6",
            peers.len()
        );
    }
    Ok(peers
        .chunks_exact(6)
        .map(|c| Peer {
            peer_id: None,
            ip: format!("{}.{}.{}.{}", c[0], c[1], c[2], c[3]),
            port: u16::from_be_bytes([c[4], c[5]]),
        })
        .collect())
}

/// Announces to the trackers until halted: when the interval elapses, when
/// the manager asks for more peers, and once the download completes. Sends
/// a best-effort `stopped` on the way out.
pub async fn run_announce_loop(
    manager: Arc<TorrentManager>,
    mut client: TrackerClient,
    mut halt: watch::Receiver<bool>,
) {
    let stats = manager.stats();
    let mut event = Event::Started;
    let mut completed_sent = manager.is_complete();
    let mut force = true;
    let mut last_forced: Option<Instant> = None;
    loop {
        match client.announce(&stats, event, force).await {
            Ok(response) => {
                if let Some(msg) = &response.warning_message {
                    log::warn!("tracker sent a warning: {msg}");
                }
                log::info!(
                    "tracker request succeeded: seeders: {}; leechers: {}; peers provided: {}",
                    response.complete,
                    response.incomplete,
                    response.peers.len()
                );
                let addrs = response
                    .peers
                    .iter()
                    .filter_map(|p| {
                        let addr = p.socket_addr();
                        if addr.is_none() {
                            log::debug!("skipping peer with non ip address {}", p.ip);
                        }
                        addr
                    })
                    .collect();
                event = Event::None;
                manager.tracker_responded(addrs);
            }
            Err(e) => log::info!("could not perform request to tracker: {e:#}"),
        }
        if force {
            last_forced = Some(Instant::now());
        }

        let wake_at = client
            .next_contact()
            .unwrap_or_else(|| Instant::now() + RETRY);
        tokio::select! {
            _ = halt.changed() => break,
            _ = sleep_until(wake_at) => force = false,
            _ = manager.tracker_wakeup().notified() => {
                force = last_forced.map_or(true, |t| t.elapsed() >= MIN_FORCED_INTERVAL);
            }
        }
        if !completed_sent && manager.is_complete() {
            completed_sent = true;
            event = Event::Completed;
            force = true;
        }
    }

    log::debug!("sending stopped event to tracker");
    match timeout(STOPPED_TIMEOUT, client.announce(&stats, Event::Stopped, true)).await {
        Ok(Ok(_)) => log::debug!("tracker acknowledged stopped event"),
        Ok(Err(e)) => log::debug!("stopped event not delivered: {e:#}"),
        Err(_) => log::debug!("stopped event timed out"),
    }
}
