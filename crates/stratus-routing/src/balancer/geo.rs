//! Client geolocation and great-circle distance

use maxminddb::geoip2;
use std::net::IpAddr;
use std::path::Path;
use tracing::warn;

/// Geographic coordinates in degrees
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

/// Haversine distance between two points in kilometres
pub fn haversine_km(a: GeoPoint, b: GeoPoint) -> f64 {
    const EARTH_RADIUS_KM: f64 = 6371.0;

    let dlat = (b.latitude - a.latitude).to_radians();
    let dlon = (b.longitude - a.longitude).to_radians();
    let h = (dlat / 2.0).sin().powi(2)
        + a.latitude.to_radians().cos() * b.latitude.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().atan2((1.0 - h).sqrt())
}

/// Resolves client IPs to coordinates
pub trait GeoResolver: Send + Sync {
    fn locate(&self, ip: IpAddr) -> Option<GeoPoint>;
}

/// Offline MaxMind GeoLite2-City database resolver
pub struct MaxMindResolver {
    reader: maxminddb::Reader<Vec<u8>>,
}

impl MaxMindResolver {
    /// Open the database at `path`; a missing or unreadable database is not
    /// fatal, geoproximity routing just degrades to latency.
    pub fn open(path: &Path) -> Option<Self> {
        match maxminddb::Reader::open_readfile(path) {
            Ok(reader) => Some(Self { reader }),
            Err(e) => {
                warn!(path = %path.display(), "geoip database unavailable: {e}");
                None
            }
        }
    }
}

impl GeoResolver for MaxMindResolver {
    fn locate(&self, ip: IpAddr) -> Option<GeoPoint> {
        let city: geoip2::City<'_> = self.reader.lookup(ip).ok()?;
        let location = city.location?;
        Some(GeoPoint { latitude: location.latitude?, longitude: location.longitude? })
    }
}

/// Fixed IP-to-location table; used in tests and air-gapped deployments
#[derive(Default)]
pub struct StaticGeoResolver {
    entries: std::collections::HashMap<IpAddr, GeoPoint>,
}

impl StaticGeoResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, ip: IpAddr, point: GeoPoint) -> Self {
        self.entries.insert(ip, point);
        self
    }
}

impl GeoResolver for StaticGeoResolver {
    fn locate(&self, ip: IpAddr) -> Option<GeoPoint> {
        self.entries.get(&ip).copied()
    }
}

/// Resolver that never locates anything; forces the latency fallback
pub struct NullGeoResolver;

impl GeoResolver for NullGeoResolver {
    fn locate(&self, _ip: IpAddr) -> Option<GeoPoint> {
        None
    }
}
