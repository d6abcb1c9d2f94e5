use std::{
    io,
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use futures::{future::BoxFuture, FutureExt};
use serde::Deserialize;
use surge_ping::{Client, Config, PingIdentifier, PingSequence, Pinger, ICMP};
use tokio::{
    net::{lookup_host, TcpStream},
    select,
    time::{sleep, timeout, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{
    config::{LatencyMethod, NetProbeConfig},
    error::{Error, ProbeError},
    probe::ProbeService,
    record::Probe,
};

/// Echo payload size, as a stock `ping` sends.
const PAYLOAD: [u8; 56] = [0; 56];

/// Probes real endpoints: round trips for latency, an HTTP geolocation
/// lookup for the country.
///
/// Latency is the mean of `samples` ICMP echoes sent from unprivileged
/// datagram sockets. When those sockets can't be opened (a kernel whose
/// `net.ipv4.ping_group_range` excludes us, say) or the TCP method was asked
/// for, TCP handshakes against the endpoint's host are timed instead; a
/// refused connection still counts there, since the RST is the host
/// answering.
pub struct NetProbe {
    client: reqwest::Client,
    echo: Echo,
    config: NetProbeConfig,
}

/// ICMP sockets per address family. Either may be missing.
#[derive(Default)]
struct Echo {
    v4: Option<Client>,
    v6: Option<Client>,
}

impl Echo {
    fn open() -> Self {
        let open = |kind: ICMP, family: &str| {
            match Client::new(&Config::builder().kind(kind).build()) {
                Ok(client) => Some(client),
                Err(e) => {
                    debug!("can't open {} echo socket: {}", family, e);
                    None
                }
            }
        };
        Self {
            v4: open(ICMP::V4, "IPv4"),
            v6: open(ICMP::V6, "IPv6"),
        }
    }

    fn is_empty(&self) -> bool {
        self.v4.is_none() && self.v6.is_none()
    }

    fn client(&self, ip: IpAddr) -> Option<&Client> {
        match ip {
            IpAddr::V4(_) => self.v4.as_ref(),
            IpAddr::V6(_) => self.v6.as_ref(),
        }
    }
}

impl NetProbe {
    pub fn new(config: NetProbeConfig) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.geo_timeout)
            .build()?;
        let echo = match config.method {
            LatencyMethod::Icmp => {
                let echo = Echo::open();
                if echo.is_empty() {
                    warn!(
                        "no ICMP echo sockets available, \
                         timing TCP handshakes instead"
                    );
                }
                echo
            }
            LatencyMethod::Tcp => Echo::default(),
        };
        Ok(Self {
            client,
            echo,
            config,
        })
    }

    async fn measure(
        &self,
        address: &str,
        cancel: &CancellationToken,
    ) -> Result<Probe, ProbeError> {
        let (host, port) = split_host_port(address)?;
        let port = self.config.probe_port.unwrap_or(port);
        let target = select! {
            biased;
            _ = cancel.cancelled() => return Err(ProbeError::Cancelled),
            res = lookup_host((host, port)) => res?
                .next()
                .ok_or_else(|| {
                    ProbeError::transport(format!("{host} didn't resolve"))
                })?,
        };
        trace!("resolved {} to {}", address, target);

        let (latency, group) = tokio::join!(
            self.round_trip(target, cancel),
            self.country(target.ip(), cancel),
        );
        Ok(Probe {
            latency: latency?,
            group,
        })
    }

    /// Mean of the samples that got an answer.
    async fn round_trip(
        &self,
        target: SocketAddr,
        cancel: &CancellationToken,
    ) -> Result<Duration, ProbeError> {
        let mut sampler = match self.echo.client(target.ip()) {
            Some(client) => {
                let mut pinger = client
                    .pinger(target.ip(), PingIdentifier(rand::random()))
                    .await;
                pinger.timeout(self.config.sample_timeout);
                Sampler::Echo(pinger)
            }
            None => Sampler::Handshake(target),
        };

        let mut samples = Vec::with_capacity(self.config.samples);
        let mut last_error = None;
        for i in 0..self.config.samples.max(1) {
            if i > 0 {
                select! {
                    biased;
                    _ = cancel.cancelled() => return Err(ProbeError::Cancelled),
                    _ = sleep(self.config.sample_interval) => {}
                }
            }
            let attempt = select! {
                biased;
                _ = cancel.cancelled() => return Err(ProbeError::Cancelled),
                res = sampler.once(i as u16, self.config.sample_timeout) => {
                    res
                }
            };
            match attempt {
                Ok(rtt) => samples.push(rtt),
                Err(reason) => {
                    trace!("sample {} to {} failed: {}", i, target, reason);
                    last_error = Some(reason);
                }
            }
        }

        if samples.is_empty() {
            return Err(ProbeError::Transport(format!(
                "{} unreachable: {}",
                sampler.describe(target),
                last_error.unwrap_or_else(|| "no samples".into())
            )));
        }
        Ok(samples.iter().sum::<Duration>() / samples.len() as u32)
    }

    /// Country name for `ip`, or `None` if the lookup fails in any way.
    async fn country(
        &self,
        ip: IpAddr,
        cancel: &CancellationToken,
    ) -> Option<String> {
        let url = self.config.geo_url.replace("{ip}", &ip.to_string());
        let lookup = async {
            self.client
                .get(&url)
                .send()
                .await?
                .error_for_status()?
                .json::<GeoReply>()
                .await
        };
        let reply = select! {
            biased;
            _ = cancel.cancelled() => return None,
            reply = lookup => reply,
        };
        match reply {
            Ok(reply) => reply.country(),
            Err(e) => {
                debug!("geolocation of {} failed: {}", ip, e);
                None
            }
        }
    }
}

impl ProbeService for NetProbe {
    fn probe<'a>(
        &'a self,
        address: &'a str,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<Probe, ProbeError>> {
        async move { self.measure(address, &cancel).await }.boxed()
    }
}

/// One way of timing a single round trip.
enum Sampler {
    Echo(Pinger),
    Handshake(SocketAddr),
}

impl Sampler {
    async fn once(
        &mut self,
        seq: u16,
        budget: Duration,
    ) -> Result<Duration, String> {
        match self {
            Sampler::Echo(pinger) => pinger
                .ping(PingSequence(seq), &PAYLOAD)
                .await
                .map(|(_, rtt)| rtt)
                .map_err(|e| e.to_string()),
            Sampler::Handshake(target) => {
                let start = Instant::now();
                match timeout(budget, TcpStream::connect(*target)).await {
                    Ok(Ok(_)) => Ok(start.elapsed()),
                    Ok(Err(e))
                        if e.kind() == io::ErrorKind::ConnectionRefused =>
                    {
                        Ok(start.elapsed())
                    }
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err(format!("no answer within {budget:?}")),
                }
            }
        }
    }

    fn describe(&self, target: SocketAddr) -> String {
        match self {
            Sampler::Echo(_) => target.ip().to_string(),
            Sampler::Handshake(_) => target.to_string(),
        }
    }
}

/// The part of an ipapi-style response we care about. Rate-limited or
/// reserved addresses come back as `{"error": true, "reason": ...}`.
#[derive(Debug, Deserialize)]
struct GeoReply {
    country_name: Option<String>,
    #[serde(default)]
    error: bool,
    reason: Option<String>,
}

impl GeoReply {
    fn country(self) -> Option<String> {
        if self.error {
            debug!(
                "geolocation refused: {}",
                self.reason.as_deref().unwrap_or("no reason given")
            );
            return None;
        }
        self.country_name.filter(|name| !name.trim().is_empty())
    }
}

/// Splits `host:port`, accepting bracketed IPv6 hosts.
fn split_host_port(address: &str) -> Result<(&str, u16), ProbeError> {
    let malformed =
        || ProbeError::transport(format!("malformed address `{address}`"));
    let (host, port) = address.trim().rsplit_once(':').ok_or_else(malformed)?;
    let host = match host.strip_prefix('[') {
        Some(rest) => rest.strip_suffix(']').ok_or_else(malformed)?,
        // a bare IPv6 address is ambiguous without brackets
        None if host.contains(':') => return Err(malformed()),
        None => host,
    };
    if host.is_empty() {
        return Err(malformed());
    }
    let port = port.parse::<u16>().map_err(|_| malformed())?;
    Ok((host, port))
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    #[test]
    fn splits_addresses() {
        assert_eq!(split_host_port("1.2.3.4:51820"), Ok(("1.2.3.4", 51820)));
        assert_eq!(
            split_host_port("nl-17.vpn.example:1194"),
            Ok(("nl-17.vpn.example", 1194))
        );
        assert_eq!(
            split_host_port("[2001:db8::7]:443"),
            Ok(("2001:db8::7", 443))
        );
    }

    #[test]
    fn rejects_malformed_addresses() {
        for bad in [
            "1.2.3.4",
            ":51820",
            "host:port",
            "2001:db8::7:443",
            "[::1:80",
            "h:70000",
        ] {
            assert!(
                matches!(split_host_port(bad), Err(ProbeError::Transport(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn reads_country_from_geo_reply() {
        let ok: GeoReply = serde_json::from_str(
            r#"{"ip":"185.159.157.20","country_name":"Switzerland"}"#,
        )
        .unwrap();
        assert_eq!(ok.country().as_deref(), Some("Switzerland"));

        let limited: GeoReply =
            serde_json::from_str(r#"{"error":true,"reason":"RateLimited"}"#)
                .unwrap();
        assert_eq!(limited.country(), None);

        let blank: GeoReply =
            serde_json::from_str(r#"{"country_name":" "}"#).unwrap();
        assert_eq!(blank.country(), None);
    }

    fn offline_probe(method: LatencyMethod, samples: usize) -> NetProbe {
        // nothing listens on port 9 locally, so geolocation fails fast
        NetProbe::new(
            NetProbeConfig::builder()
                .method(method)
                .samples(samples)
                .geo_url("http://127.0.0.1:9/{ip}")
                .build(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn times_local_handshakes_without_a_country() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let probe = offline_probe(LatencyMethod::Tcp, 2);

        let result = probe
            .probe(&address, CancellationToken::new())
            .await
            .unwrap();
        assert!(result.latency < Duration::from_secs(1));
        assert_eq!(result.group, None);
    }

    #[tokio::test]
    async fn malformed_address_is_a_transport_error() {
        let probe = offline_probe(LatencyMethod::Tcp, 1);
        let err = probe
            .probe("no-port-here", CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Transport(_)));
    }

    #[tokio::test]
    async fn honors_cancellation() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let probe = offline_probe(LatencyMethod::Icmp, 3);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = probe.probe(&address, cancel).await.unwrap_err();
        assert_eq!(err, ProbeError::Cancelled);
    }

    #[tokio::test]
    async fn loopback_answers_with_the_default_method() {
        // echoes when the kernel hands out ICMP sockets, handshakes with
        // the listener when it doesn't; either way loopback must answer
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let probe = offline_probe(LatencyMethod::Icmp, 2);

        let result = probe
            .probe(&address, CancellationToken::new())
            .await
            .unwrap();
        assert!(result.latency < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn tcp_method_never_opens_echo_sockets() {
        let probe = offline_probe(LatencyMethod::Tcp, 1);
        assert!(probe.echo.is_empty());
    }

    #[tokio::test]
    async fn unanswered_handshakes_are_a_transport_error() {
        // TEST-NET-1 is never routed, so every handshake goes unanswered
        let probe = NetProbe::new(
            NetProbeConfig::builder()
                .method(LatencyMethod::Tcp)
                .samples(2)
                .sample_timeout(Duration::from_millis(50))
                .geo_url("http://127.0.0.1:9/{ip}")
                .build(),
        )
        .unwrap();
        let err = probe
            .probe("192.0.2.1:51820", CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            ProbeError::Transport(reason) => {
                assert!(reason.starts_with("192.0.2.1:51820 unreachable"))
            }
            other => panic!("expected a transport error, got {other:?}"),
        }
    }
}
