use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair,
    KeyUsagePurpose, SanType,
};
use rustls::ServerConfig as RustlsServerConfig;
use rustls_pemfile::{certs, read_one, Item};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use time::{Duration as TimeDuration, OffsetDateTime};

/// Where the server certificate pair lives on disk.
#[derive(Debug, Clone)]
pub struct CertificateConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl Default for CertificateConfig {
    fn default() -> Self {
        Self {
            cert_path: PathBuf::from("certs/server-cert.pem"),
            key_path: PathBuf::from("certs/server-key.pem"),
        }
    }
}

/// Build the TLS acceptor configuration, loading the persisted certificate
/// pair or generating and persisting a self-signed one on first start.
pub fn server_tls_config(
    config: &CertificateConfig,
    hostname: &str,
    public_ip: Option<IpAddr>,
) -> Result<Arc<RustlsServerConfig>> {
    let (cert_chain, private_key) =
        if config.cert_path.exists() && config.key_path.exists() {
            tracing::info!(path = %config.cert_path.display(), "Loading existing server certificate");
            load_cert_pair(config)?
        } else {
            tracing::info!(
                hostname,
                path = %config.cert_path.display(),
                "Generating self-signed server certificate"
            );
            generate_cert_pair(config, hostname, public_ip)?
        };

    let tls = RustlsServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, private_key)
        .map_err(|err| anyhow!("invalid TLS certificate/private key pair: {err}"))?;

    Ok(Arc::new(tls))
}

fn load_cert_pair(
    config: &CertificateConfig,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let cert_data = fs::read(&config.cert_path).with_context(|| {
        format!(
            "failed to read TLS certificate at {}",
            config.cert_path.display()
        )
    })?;
    let mut reader = cert_data.as_slice();
    let cert_chain: Vec<CertificateDer<'static>> = certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| {
            format!(
                "failed to parse TLS certificate at {}",
                config.cert_path.display()
            )
        })?;
    if cert_chain.is_empty() {
        anyhow::bail!(
            "no certificates were found in {}",
            config.cert_path.display()
        );
    }

    let key_data = fs::read(&config.key_path).with_context(|| {
        format!(
            "failed to read TLS private key at {}",
            config.key_path.display()
        )
    })?;
    let mut reader = key_data.as_slice();
    while let Some(item) = read_one(&mut reader).with_context(|| {
        format!(
            "failed to parse PEM entry in TLS private key ({})",
            config.key_path.display()
        )
    })? {
        let der: PrivateKeyDer<'static> = match item {
            Item::Pkcs8Key(key) => key.into(),
            Item::Pkcs1Key(key) => key.into(),
            Item::Sec1Key(key) => key.into(),
            _ => continue,
        };
        return Ok((cert_chain, der));
    }

    anyhow::bail!(
        "no supported private key (pkcs8/pkcs1/sec1) was found in {}",
        config.key_path.display()
    )
}

fn generate_cert_pair(
    config: &CertificateConfig,
    hostname: &str,
    public_ip: Option<IpAddr>,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, hostname);
    params.distinguished_name = dn;

    let now = OffsetDateTime::now_utc();
    params.not_before = now - TimeDuration::days(1);
    params.not_after = now + TimeDuration::days(5 * 365);

    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.subject_alt_names = subject_alt_names(hostname, public_ip)?;

    let key_pair = KeyPair::generate().context("failed to generate certificate key pair")?;
    let cert = params
        .self_signed(&key_pair)
        .context("failed to self-sign server certificate")?;

    persist_pem(&config.cert_path, &cert.pem())?;
    persist_pem(&config.key_path, &key_pair.serialize_pem())?;

    let cert_der = cert.der().clone();
    let key_der: PrivateKeyDer<'static> =
        PrivatePkcs8KeyDer::from(key_pair.serialize_der()).into();
    Ok((vec![cert_der], key_der))
}

/// SAN set covering every name and address clients are known to dial:
/// the configured hostname (plus wildcard), localhost, the public IP as both
/// DNS entry and IP entry, loopback/any for both families, and the local
/// routable interface address.
fn subject_alt_names(hostname: &str, public_ip: Option<IpAddr>) -> Result<Vec<SanType>> {
    let mut sans = Vec::new();

    let mut dns_names = vec![hostname.to_owned(), format!("*.{hostname}")];
    if hostname != "localhost" {
        dns_names.push("localhost".to_owned());
    }
    if let Ok(machine) = std::env::var("HOSTNAME") {
        if !machine.is_empty() && machine.is_ascii() && machine != hostname {
            dns_names.push(machine);
        }
    }
    if let Some(ip) = public_ip {
        dns_names.push(ip.to_string());
    }
    for name in dns_names {
        sans.push(SanType::DnsName(name.clone().try_into().map_err(|_| {
            anyhow!("cannot encode SAN dns name {name:?}")
        })?));
    }

    let mut ips: Vec<IpAddr> = vec![
        IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(Ipv6Addr::LOCALHOST),
        IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    ];
    if let Some(ip) = public_ip {
        ips.push(ip);
    }
    if let Some(ip) = local_routable_ipv4() {
        ips.push(ip);
    }
    ips.dedup();
    sans.extend(ips.into_iter().map(SanType::IpAddress));

    Ok(sans)
}

/// Discover the interface address the OS would route external traffic from.
/// No packets are sent; connect() on UDP only selects a source address.
fn local_routable_ipv4() -> Option<IpAddr> {
    let socket = std::net::UdpSocket::bind(("0.0.0.0", 0)).ok()?;
    socket.connect(("8.8.8.8", 80)).ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

fn persist_pem(path: &Path, pem: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create certificate directory {}", parent.display())
            })?;
        }
    }
    fs::write(path, pem)
        .with_context(|| format!("failed to persist PEM file at {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_config(dir: &tempfile::TempDir) -> CertificateConfig {
        CertificateConfig {
            cert_path: dir.path().join("server-cert.pem"),
            key_path: dir.path().join("server-key.pem"),
        }
    }

    #[test]
    fn generates_and_persists_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let config = temp_config(&dir);

        let tls = server_tls_config(&config, "race.example", None).unwrap();
        assert!(config.cert_path.exists());
        assert!(config.key_path.exists());
        drop(tls);
    }

    #[test]
    fn reloads_persisted_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let config = temp_config(&dir);

        server_tls_config(&config, "race.example", None).unwrap();
        let first = fs::read(&config.cert_path).unwrap();

        // Second start must load, not regenerate.
        server_tls_config(&config, "race.example", None).unwrap();
        let second = fs::read(&config.cert_path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn san_set_covers_required_names() {
        let sans =
            subject_alt_names("race.example", Some(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7))))
                .unwrap();

        let dns = format!(
            "{:?}",
            sans.iter()
                .filter(|san| matches!(san, SanType::DnsName(_)))
                .collect::<Vec<_>>()
        );
        assert!(dns.contains("race.example"));
        assert!(dns.contains("*.race.example"));
        assert!(dns.contains("localhost"));
        assert!(dns.contains("203.0.113.7"));

        let ips: Vec<IpAddr> = sans
            .iter()
            .filter_map(|san| match san {
                SanType::IpAddress(ip) => Some(*ip),
                _ => None,
            })
            .collect();
        assert!(ips.contains(&IpAddr::V4(Ipv4Addr::LOCALHOST)));
        assert!(ips.contains(&IpAddr::V6(Ipv6Addr::UNSPECIFIED)));
        assert!(ips.contains(&IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7))));
    }
}
