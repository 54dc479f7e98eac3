//! Security header timestamp.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};

use crate::error::MessageSecurityError;
use crate::serializer::{malformed, with_wsu_id};
use crate::standards::{node, prefix, WSU_NS};
use crate::xml::XmlElement;

/// A `wsu:Timestamp`: creation and expiry times at millisecond precision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityTimestamp {
    id: String,
    created: DateTime<Utc>,
    expires: DateTime<Utc>,
    /// Digest of the timestamp as signed, once known
    pub digest: Option<Vec<u8>>,
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

fn format_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_time(text: &str) -> Result<DateTime<Utc>, MessageSecurityError> {
    DateTime::parse_from_rfc3339(text.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| malformed("Timestamp", format!("invalid time '{}': {}", text.trim(), e)))
}

impl SecurityTimestamp {
    /// Create a timestamp. Creation must not be after expiry.
    pub fn new(
        id: impl Into<String>,
        created: DateTime<Utc>,
        expires: DateTime<Utc>,
    ) -> Result<Self, MessageSecurityError> {
        let created = created.trunc_subsecs(3);
        let expires = expires.trunc_subsecs(3);
        if created > expires {
            return Err(MessageSecurityError::TimestampInverted {
                created: format_time(&created),
                expires: format_time(&expires),
            });
        }
        Ok(Self {
            id: id.into(),
            created,
            expires,
            digest: None,
        })
    }

    /// Timestamp created now and valid for `validity`.
    pub fn issue(id: impl Into<String>, validity: Duration) -> Result<Self, MessageSecurityError> {
        let now = Utc::now();
        Self::new(id, now, now + to_chrono(validity))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn expires(&self) -> DateTime<Utc> {
        self.expires
    }

    /// Check freshness against `now`.
    ///
    /// Fresh means `expires > now - skew`, `created < now + skew` and
    /// `created > now - (validity + skew)`. An infinite skew (`None`)
    /// accepts any timestamp.
    pub fn validate_freshness(
        &self,
        now: DateTime<Utc>,
        validity: Duration,
        max_clock_skew: Option<Duration>,
    ) -> Result<(), MessageSecurityError> {
        let Some(skew) = max_clock_skew else {
            return Ok(());
        };
        let skew = to_chrono(skew);
        let validity = to_chrono(validity);

        if self.expires <= now - skew {
            return Err(MessageSecurityError::TimestampExpired {
                expires: format_time(&self.expires),
                now: format_time(&now),
                skew_secs: skew.num_seconds(),
            });
        }
        if self.created >= now + skew {
            return Err(MessageSecurityError::TimestampInFuture {
                created: format_time(&self.created),
                now: format_time(&now),
                skew_secs: skew.num_seconds(),
            });
        }
        if self.created <= now - (validity + skew) {
            return Err(MessageSecurityError::TimestampTooOld {
                created: format_time(&self.created),
                validity_secs: validity.num_seconds(),
            });
        }
        Ok(())
    }

    pub fn to_xml(&self) -> XmlElement {
        with_wsu_id(XmlElement::new(prefix::WSU, node::TIMESTAMP, WSU_NS), &self.id)
            .with_child(
                XmlElement::new(prefix::WSU, node::CREATED, WSU_NS)
                    .with_text(format_time(&self.created)),
            )
            .with_child(
                XmlElement::new(prefix::WSU, node::EXPIRES, WSU_NS)
                    .with_text(format_time(&self.expires)),
            )
    }

    pub fn from_xml(element: &XmlElement) -> Result<Self, MessageSecurityError> {
        const NAME: &str = "Timestamp";
        if !element.is(WSU_NS, node::TIMESTAMP) {
            return Err(malformed(NAME, format!("unexpected element {}", element.qname())));
        }
        let id = element.id().ok_or_else(|| malformed(NAME, "missing Id"))?;
        let created = element
            .child_text(WSU_NS, node::CREATED)
            .ok_or_else(|| malformed(NAME, "missing Created"))?;
        let expires = element
            .child_text(WSU_NS, node::EXPIRES)
            .ok_or_else(|| malformed(NAME, "missing Expires"))?;
        Self::new(id, parse_time(&created)?, parse_time(&expires)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml::parse_document;

    const SKEW: Duration = Duration::from_secs(300);
    const VALIDITY: Duration = Duration::from_secs(300);

    fn at(created: DateTime<Utc>, expires: DateTime<Utc>) -> SecurityTimestamp {
        SecurityTimestamp::new("ts-1", created, expires).unwrap()
    }

    #[test]
    fn test_inverted_timestamp_rejected() {
        let now = Utc::now();
        let err = SecurityTimestamp::new("ts", now, now - chrono::Duration::seconds(1)).unwrap_err();
        assert!(matches!(err, MessageSecurityError::TimestampInverted { .. }));
    }

    #[test]
    fn test_fresh_timestamp() {
        let now = Utc::now().trunc_subsecs(3);
        let ts = at(now, now + chrono::Duration::minutes(5));
        assert!(ts.validate_freshness(now, VALIDITY, Some(SKEW)).is_ok());
    }

    // --- Skew boundary ---

    #[test]
    fn test_expiry_exactly_at_skew_edge_rejected() {
        let now = Utc::now().trunc_subsecs(3);
        let expires = now - chrono::Duration::seconds(300);
        let ts = at(expires - chrono::Duration::seconds(10), expires);
        let err = ts.validate_freshness(now, VALIDITY, Some(SKEW)).unwrap_err();
        assert!(matches!(err, MessageSecurityError::TimestampExpired { .. }));
    }

    #[test]
    fn test_expiry_one_millisecond_inside_skew_accepted() {
        let now = Utc::now().trunc_subsecs(3);
        let expires = now - chrono::Duration::seconds(300) + chrono::Duration::milliseconds(1);
        let ts = at(expires - chrono::Duration::seconds(10), expires);
        assert!(ts.validate_freshness(now, VALIDITY, Some(SKEW)).is_ok());
    }

    #[test]
    fn test_future_creation_rejected() {
        let now = Utc::now().trunc_subsecs(3);
        let created = now + chrono::Duration::seconds(301);
        let ts = at(created, created + chrono::Duration::seconds(60));
        let err = ts.validate_freshness(now, VALIDITY, Some(SKEW)).unwrap_err();
        assert!(matches!(err, MessageSecurityError::TimestampInFuture { .. }));
    }

    #[test]
    fn test_old_creation_rejected() {
        let now = Utc::now().trunc_subsecs(3);
        let created = now - chrono::Duration::seconds(601);
        let ts = at(created, now + chrono::Duration::hours(1));
        let err = ts.validate_freshness(now, VALIDITY, Some(SKEW)).unwrap_err();
        assert!(matches!(err, MessageSecurityError::TimestampTooOld { .. }));
    }

    #[test]
    fn test_infinite_skew_accepts_anything() {
        let now = Utc::now();
        let ts = at(now - chrono::Duration::days(30), now - chrono::Duration::days(29));
        assert!(ts.validate_freshness(now, VALIDITY, None).is_ok());
    }

    // --- Wire form ---

    #[test]
    fn test_xml_round_trip_keeps_milliseconds() {
        let ts = SecurityTimestamp::issue("ts-9", Duration::from_secs(300)).unwrap();
        let xml = ts.to_xml().to_xml();
        assert!(xml.contains("Z</u:Created>"));
        let back = SecurityTimestamp::from_xml(&parse_document(&xml).unwrap()).unwrap();
        assert_eq!(back, ts);
    }

    #[test]
    fn test_missing_expires_rejected() {
        let xml = format!(
            r#"<u:Timestamp xmlns:u="{}" u:Id="t"><u:Created>2024-01-01T00:00:00.000Z</u:Created></u:Timestamp>"#,
            WSU_NS
        );
        let err = SecurityTimestamp::from_xml(&parse_document(&xml).unwrap()).unwrap_err();
        assert!(matches!(err, MessageSecurityError::Malformed { .. }));
    }
}
