//! Geographic points and the location marker protocol.
//!
//! Peer edge sites tag relayed queries with a LOC resource record (RFC 1876)
//! in the additional section. The record doubles as a relay flag: a query
//! carrying one came from a peer site, not a client, and the encoded point is
//! the origin used for closest-site selection.

use hickory_proto::op::Message;
use hickory_proto::rr::rdata::NULL;
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use serde::{Deserialize, Serialize};

/// RR type number of the LOC record (RFC 1876). Hickory has no native rdata
/// for it, so it travels as unknown RDATA bytes.
pub const LOC_RR_TYPE: u16 = 29;

/// Mean Earth radius in kilometers.
const EARTH_RADIUS_KM: f64 = 6371.0;

/// RFC 1876 offsets latitude/longitude by 2^31 around the equator/meridian.
const LOC_DEGREE_OFFSET: i64 = 1 << 31;

/// Thousandths of an arc-second per degree.
const MILLIARCSECS_PER_DEGREE: f64 = 3_600_000.0;

/// RFC 1876 altitude is centimeters above a base 100km below sea level.
const LOC_ALTITUDE_BASE_CM: u32 = 10_000_000;

/// A geographic coordinate in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Latitude, positive north.
    pub lat: f64,
    /// Longitude, positive east.
    pub lon: f64,
}

impl Point {
    /// Create a point from decimal degrees.
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// True if the coordinates are within the valid degree ranges.
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }

    /// Great-circle distance to `other` in kilometers (haversine).
    pub fn distance(&self, other: &Point) -> f64 {
        let lat1 = self.lat.to_radians();
        let lat2 = other.lat.to_radians();
        let dlat = (other.lat - self.lat).to_radians();
        let dlon = (other.lon - self.lon).to_radians();

        let a = (dlat / 2.0).sin().powi(2)
            + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_KM * a.sqrt().min(1.0).asin()
    }
}

/// Encode a point as a LOC resource record suitable for the additional
/// section. Size and precision fields use the RFC 1876 defaults; altitude is
/// fixed at sea level.
pub fn encode_marker(point: Point) -> Record {
    let mut rdata = Vec::with_capacity(16);
    rdata.push(0); // version
    rdata.push(0x12); // size: 1m
    rdata.push(0x16); // horizontal precision: 10km
    rdata.push(0x13); // vertical precision: 10m
    rdata.extend_from_slice(&degrees_to_wire(point.lat).to_be_bytes());
    rdata.extend_from_slice(&degrees_to_wire(point.lon).to_be_bytes());
    rdata.extend_from_slice(&LOC_ALTITUDE_BASE_CM.to_be_bytes());

    let mut record = Record::from_rdata(
        Name::root(),
        0,
        RData::Unknown {
            code: hickory_proto::rr::RecordType::Unknown(LOC_RR_TYPE),
            rdata: NULL::with(rdata),
        },
    );
    record.set_dns_class(DNSClass::IN);
    record
}

/// Decode a LOC record back into a point. Returns `None` for records of a
/// different type, unknown LOC versions, or short RDATA.
pub fn decode_marker(record: &Record) -> Option<Point> {
    let bytes = match record.data() {
        RData::Unknown { code, rdata } if *code == hickory_proto::rr::RecordType::Unknown(LOC_RR_TYPE) => rdata.anything(),
        _ => return None,
    };
    if bytes.len() < 16 || bytes[0] != 0 {
        return None;
    }
    let lat = u32::from_be_bytes(bytes[4..8].try_into().ok()?);
    let lon = u32::from_be_bytes(bytes[8..12].try_into().ok()?);
    Some(Point {
        lat: wire_to_degrees(lat),
        lon: wire_to_degrees(lon),
    })
}

/// Scan the additional section for a LOC record; decode and remove the first
/// one found, leaving every other record in place.
pub fn extract_marker(msg: &mut Message) -> Option<Point> {
    let additionals = msg.take_additionals();
    let mut found = None;
    for record in additionals {
        if found.is_none() && record.record_type() == RecordType::Unknown(LOC_RR_TYPE) {
            if let Some(point) = decode_marker(&record) {
                found = Some(point);
                continue;
            }
        }
        msg.add_additional(record);
    }
    found
}

/// Append a location record to the additional section.
pub fn insert_marker(msg: &mut Message, marker: &Record) {
    msg.add_additional(marker.clone());
}

fn degrees_to_wire(degrees: f64) -> u32 {
    let milliarcsecs = (degrees * MILLIARCSECS_PER_DEGREE).round() as i64;
    (LOC_DEGREE_OFFSET + milliarcsecs) as u32
}

fn wire_to_degrees(wire: u32) -> f64 {
    (wire as i64 - LOC_DEGREE_OFFSET) as f64 / MILLIARCSECS_PER_DEGREE
}
