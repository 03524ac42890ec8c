// Tracking-token decoding. Token issuance lives in the external
// authentication service; this side only verifies and unpacks the claims
// that scope a producer or viewer to one race.

use anyhow::Result;
use chrono::NaiveDate;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::races_repo::NewRace;

pub const TOKEN_AUDIENCE: &str = "api.hikeandfly.app";
pub const TOKEN_ISSUER: &str = "hikeandfly.app";

/// Race metadata embedded in a tracking token, enough to lazily create the
/// race row on first contact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRace {
    pub name: String,
    pub date: NaiveDate,
    pub end_date: NaiveDate,
    pub timezone: String,
    pub location: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingClaims {
    /// `contest:{race_id}`
    pub sub: String,
    pub pilot_id: String,
    pub pilot_name: String,
    pub race: TokenRace,
    pub exp: i64,
}

impl TrackingClaims {
    pub fn race_id(&self) -> Option<&str> {
        self.sub.strip_prefix("contest:")
    }

    pub fn new_race(&self) -> Option<NewRace> {
        let race_id = self.race_id()?;
        Some(NewRace {
            race_id: race_id.to_string(),
            name: self.race.name.clone(),
            date: self.race.date,
            end_date: self.race.end_date,
            timezone: self.race.timezone.clone(),
            location: self.race.location.clone(),
        })
    }
}

#[derive(Clone)]
pub struct TokenVerifier {
    decoding_key: DecodingKey,
}

impl TokenVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_ref()),
        }
    }

    /// Decode and verify a token without pinning the race; the caller takes
    /// the race id from the claims themselves.
    pub fn peek(&self, token: &str) -> Result<TrackingClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[TOKEN_AUDIENCE]);
        validation.set_issuer(&[TOKEN_ISSUER]);

        decode::<TrackingClaims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| anyhow::anyhow!("invalid tracking token: {}", e))
    }

    /// Decode and verify a tracking token, checking that it is scoped to
    /// the given race.
    pub fn verify(&self, token: &str, race_id: &str) -> Result<TrackingClaims> {
        let claims = self.peek(token)?;
        match claims.race_id() {
            Some(token_race) if token_race == race_id => Ok(claims),
            Some(_) => Err(anyhow::anyhow!("token not valid for this race")),
            None => Err(anyhow::anyhow!("token subject is not a contest")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn make_token(secret: &str, sub: &str) -> String {
        #[derive(Serialize)]
        struct FullClaims {
            sub: String,
            pilot_id: String,
            pilot_name: String,
            race: TokenRace,
            exp: i64,
            aud: String,
            iss: String,
        }
        let claims = FullClaims {
            sub: sub.to_string(),
            pilot_id: "p1".into(),
            pilot_name: "Test Pilot".into(),
            race: TokenRace {
                name: "Alps Open".into(),
                date: NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
                end_date: NaiveDate::from_ymd_opt(2025, 6, 8).unwrap(),
                timezone: "Europe/Rome".into(),
                location: "Bassano".into(),
            },
            exp: Utc::now().timestamp() + 3600,
            aud: TOKEN_AUDIENCE.into(),
            iss: TOKEN_ISSUER.into(),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_ref()),
        )
        .unwrap()
    }

    #[test]
    fn test_verify_round_trip() {
        let verifier = TokenVerifier::new("secret");
        let token = make_token("secret", "contest:race1");

        let claims = verifier.verify(&token, "race1").unwrap();
        assert_eq!(claims.pilot_id, "p1");
        assert_eq!(claims.race_id(), Some("race1"));
        assert_eq!(claims.race.timezone, "Europe/Rome");

        let new_race = claims.new_race().unwrap();
        assert_eq!(new_race.race_id, "race1");
    }

    #[test]
    fn test_verify_rejects_wrong_race_and_secret() {
        let verifier = TokenVerifier::new("secret");

        let token = make_token("secret", "contest:other");
        assert!(verifier.verify(&token, "race1").is_err());

        let token = make_token("wrong-secret", "contest:race1");
        assert!(verifier.verify(&token, "race1").is_err());

        let token = make_token("secret", "user:someone");
        assert!(verifier.verify(&token, "race1").is_err());
    }
}
