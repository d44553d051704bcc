//! # GPS Fix Records
//!
//! Structured position fixes and the parser for the device's fix response.
//!
//! The response payload is a fixed-order comma-separated record:
//!
//! ```text
//! $GPSACP: <utc hhmmss.sss>,<lat ddmm.mmmm><N|S>,<lon dddmm.mmmm><E|W>,<hdop>,
//!          <altitude>,<fix 0-3>,<course>,<speed km/h>,<speed knots>,<date ddmmyy>,
//!          <gps sats>,<glonass sats>
//! ```

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone};
use serde_json::{json, Value};

use crate::error::{Result, TelemetryError};

/// Minimum number of fields up to and including the GPS satellite count
const MIN_FIELD_COUNT: usize = 11;

/// Field positions within the fix record
const FIELD_TIME: usize = 0;
const FIELD_LATITUDE: usize = 1;
const FIELD_LONGITUDE: usize = 2;
const FIELD_HDOP: usize = 3;
const FIELD_ALTITUDE: usize = 4;
const FIELD_FIX: usize = 5;
const FIELD_COURSE: usize = 6;
const FIELD_SPEED_KMH: usize = 7;
const FIELD_DATE: usize = 9;
const FIELD_SATS_GPS: usize = 10;
const FIELD_SATS_GLONASS: usize = 11;

/// Quality of a GPS fix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixQuality {
    NoFix,
    Fix2D,
    Fix3D,
}

impl FixQuality {
    /// Map the device's fix code; only 2 and 3 are valid fixes
    pub fn from_code(code: u8) -> Self {
        match code {
            2 => FixQuality::Fix2D,
            3 => FixQuality::Fix3D,
            _ => FixQuality::NoFix,
        }
    }
}

/// A single GPS position/velocity reading
///
/// Position, heading and speed are only meaningful when
/// `fix_quality != NoFix`. A NoFix value is a valid sentinel.
#[derive(Debug, Clone, PartialEq)]
pub struct Fix {
    pub latitude: f64,
    pub longitude: f64,
    pub heading: Option<f64>,
    pub speed_kmh: f64,
    pub fix_quality: FixQuality,
    pub satellite_count: u8,
    pub altitude_m: Option<f64>,
    pub hdop: Option<f64>,
    /// Local time, derived from device UTC and the configured offset
    pub timestamp: Option<DateTime<FixedOffset>>,
}

impl Fix {
    /// The NoFix sentinel published when no usable record is available
    pub fn no_fix() -> Self {
        Fix {
            latitude: 0.0,
            longitude: 0.0,
            heading: None,
            speed_kmh: 0.0,
            fix_quality: FixQuality::NoFix,
            satellite_count: 0,
            altitude_m: None,
            hdop: None,
            timestamp: None,
        }
    }

    /// Whether this fix carries a usable 2D or 3D position
    pub fn is_valid(&self) -> bool {
        matches!(self.fix_quality, FixQuality::Fix2D | FixQuality::Fix3D)
    }

    /// Body of a position ping: `{date, lat, lng, speed}`
    ///
    /// Fields are strings, as the location endpoint expects them.
    pub fn upload_body(&self) -> Value {
        let date = self
            .timestamp
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        json!({
            "date": date,
            "lat": self.latitude.to_string(),
            "lng": self.longitude.to_string(),
            "speed": self.speed_kmh.to_string(),
        })
    }

    /// Short annotation string: `lat,lng,course,speedkmh`
    pub fn overlay_text(&self) -> Option<String> {
        if !self.is_valid() {
            return None;
        }
        Some(format!(
            "{:.6},{:.6},{:03},{:03}kmh",
            self.latitude,
            self.longitude,
            self.heading.unwrap_or(0.0) as u32,
            self.speed_kmh as u32
        ))
    }
}

/// Parses fix response lines into [`Fix`] records
#[derive(Debug, Clone)]
pub struct FixParser {
    marker: String,
    utc_offset: FixedOffset,
}

impl FixParser {
    /// Create a parser for lines starting with `marker`
    ///
    /// # Errors
    ///
    /// Returns `Protocol` if the offset is outside ±24h.
    pub fn new(marker: impl Into<String>, utc_offset_minutes: i32) -> Result<Self> {
        let utc_offset = FixedOffset::east_opt(utc_offset_minutes * 60).ok_or_else(|| {
            TelemetryError::Protocol(format!("invalid UTC offset: {} minutes", utc_offset_minutes))
        })?;
        Ok(Self {
            marker: marker.into(),
            utc_offset,
        })
    }

    /// Parse one response line
    ///
    /// A well-formed record with a fix code other than 2 or 3 parses to a
    /// NoFix value.
    ///
    /// # Errors
    ///
    /// Returns `Protocol` if the marker is missing, the record is short, or a
    /// field of a valid fix does not parse.
    pub fn parse(&self, line: &str) -> Result<Fix> {
        let payload = line
            .trim()
            .strip_prefix(self.marker.as_str())
            .ok_or_else(|| TelemetryError::Protocol(format!("missing fix marker: {:?}", line)))?;
        let payload = payload.trim_start_matches(':').trim();

        let fields: Vec<&str> = payload.split(',').map(str::trim).collect();
        if fields.len() < MIN_FIELD_COUNT {
            return Err(TelemetryError::Protocol(format!(
                "short fix record: {} fields",
                fields.len()
            )));
        }

        let code: u8 = fields[FIELD_FIX].parse().unwrap_or(0);
        let fix_quality = FixQuality::from_code(code);
        if fix_quality == FixQuality::NoFix {
            return Ok(Fix {
                satellite_count: satellites(&fields),
                ..Fix::no_fix()
            });
        }

        let timestamp = self.local_time(fields[FIELD_DATE], fields[FIELD_TIME])?;

        Ok(Fix {
            latitude: parse_coordinate(fields[FIELD_LATITUDE], 'N', 'S')?,
            longitude: parse_coordinate(fields[FIELD_LONGITUDE], 'E', 'W')?,
            heading: optional_number(fields[FIELD_COURSE])?,
            speed_kmh: required_number(fields[FIELD_SPEED_KMH], "speed")?,
            fix_quality,
            satellite_count: satellites(&fields),
            altitude_m: optional_number(fields[FIELD_ALTITUDE])?,
            hdop: optional_number(fields[FIELD_HDOP])?,
            timestamp: Some(timestamp),
        })
    }

    fn local_time(&self, date: &str, time: &str) -> Result<DateTime<FixedOffset>> {
        let date = NaiveDate::parse_from_str(date, "%d%m%y")
            .map_err(|e| TelemetryError::Protocol(format!("bad fix date {:?}: {}", date, e)))?;
        let time = NaiveTime::parse_from_str(time, "%H%M%S%.f")
            .map_err(|e| TelemetryError::Protocol(format!("bad fix time {:?}: {}", time, e)))?;
        let utc = NaiveDateTime::new(date, time);
        Ok(self.utc_offset.from_utc_datetime(&utc))
    }
}

/// Convert `DDMM.MMMM` (or `DDDMM.MMMM`) to decimal degrees
///
/// `decimal = floor(value / 100) + (value mod 100) / 60`
pub fn ddm_to_decimal(value: f64) -> f64 {
    let degrees = (value / 100.0).trunc();
    let minutes = value - degrees * 100.0;
    degrees + minutes / 60.0
}

fn parse_coordinate(field: &str, positive: char, negative: char) -> Result<f64> {
    let (number, sign) = match field.chars().last() {
        Some(c) if c.eq_ignore_ascii_case(&positive) => (&field[..field.len() - 1], 1.0),
        Some(c) if c.eq_ignore_ascii_case(&negative) => (&field[..field.len() - 1], -1.0),
        _ => (field, 1.0),
    };
    let value = required_number(number, "coordinate")?;
    Ok(sign * ddm_to_decimal(value))
}

fn required_number(field: &str, name: &str) -> Result<f64> {
    field
        .parse::<f64>()
        .map_err(|_| TelemetryError::Protocol(format!("bad {} field: {:?}", name, field)))
}

fn optional_number(field: &str) -> Result<Option<f64>> {
    if field.is_empty() {
        return Ok(None);
    }
    required_number(field, "numeric").map(Some)
}

fn satellites(fields: &[&str]) -> u8 {
    let count = |i: usize| -> u32 {
        fields
            .get(i)
            .and_then(|f| f.parse::<u32>().ok())
            .unwrap_or(0)
    };
    (count(FIELD_SATS_GPS) + count(FIELD_SATS_GLONASS)).min(u8::MAX as u32) as u8
}
