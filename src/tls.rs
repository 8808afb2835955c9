use std::{
    fmt,
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    sync::Arc,
};

use arc_swap::ArcSwap;
use log::{debug, error, info};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use rustls::{
    crypto::ring::sign::any_supported_type,
    server::{ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
};
use tokio_util::sync::CancellationToken;

use crate::Error;

/// Serving certificate that follows changes to its PEM files on disk.
///
/// Handshakes read the current pair without locking. A pair that fails to load is
/// logged and the previous one stays in use.
pub struct ReloadingCert {
    current: ArcSwap<CertifiedKey>,
    cert_path: PathBuf,
    key_path: PathBuf,
}

impl fmt::Debug for ReloadingCert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReloadingCert")
            .field("cert_path", &self.cert_path)
            .field("key_path", &self.key_path)
            .finish()
    }
}

impl ReloadingCert {
    pub fn new(cert_path: &Path, key_path: &Path) -> Result<Self, Error> {
        let pair = load_pair(cert_path, key_path)?;
        info!("loaded TLS certificate from {}", cert_path.display());
        Ok(ReloadingCert {
            current: ArcSwap::from_pointee(pair),
            cert_path: cert_path.to_path_buf(),
            key_path: key_path.to_path_buf(),
        })
    }

    pub fn current(&self) -> Arc<CertifiedKey> {
        self.current.load_full()
    }

    /// Replaces the active pair once the files on disk parse and the key matches the
    /// leaf certificate.
    pub fn reload(&self) -> Result<(), Error> {
        let pair = load_pair(&self.cert_path, &self.key_path)?;
        self.current.store(Arc::new(pair));
        info!("updated current TLS certificate");
        Ok(())
    }

    /// Watches both files until `token` is cancelled.
    pub async fn run(self: Arc<Self>, token: CancellationToken) -> Result<(), Error> {
        let (sender, mut events) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(
            move |event: notify::Result<notify::Event>| {
                let _ = sender.send(event);
            },
        )?;
        for path in [&self.cert_path, &self.key_path] {
            watcher.watch(path, RecursiveMode::NonRecursive)?;
        }
        info!("starting certificate watcher");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                event = events.recv() => match event {
                    Some(Ok(event)) => self.handle_event(&mut watcher, event),
                    Some(Err(e)) => error!("certificate watch: {e}"),
                    None => break,
                },
            }
        }

        info!("certificate watcher stopped");
        Ok(())
    }

    fn handle_event(&self, watcher: &mut RecommendedWatcher, event: notify::Event) {
        let removed = matches!(event.kind, EventKind::Remove(_));
        if !removed && !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
            return;
        }
        debug!("certificate event: {event:?}");

        // the watch is dropped together with the inode
        if removed {
            for path in &event.paths {
                if let Err(e) = watcher.watch(path, RecursiveMode::NonRecursive) {
                    error!("re-watching {}: {e}", path.display());
                }
            }
        }

        if let Err(e) = self.reload() {
            error!("re-reading certificate: {e}");
        }
    }
}

impl ResolvesServerCert for ReloadingCert {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.current())
    }
}

fn load_pair(cert_path: &Path, key_path: &Path) -> Result<CertifiedKey, Error> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
        .collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(Error::Tls(format!(
            "no certificate found in {}",
            cert_path.display()
        )));
    }

    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
        .ok_or_else(|| Error::Tls(format!("no private key found in {}", key_path.display())))?;
    let key = any_supported_type(&key)
        .map_err(|e| Error::Tls(format!("unsupported private key: {e}")))?;

    let pair = CertifiedKey::new(certs, key);
    // a rotation writes the two files separately
    pair.keys_match()
        .map_err(|e| Error::Tls(format!("private key does not match certificate: {e}")))?;
    Ok(pair)
}
