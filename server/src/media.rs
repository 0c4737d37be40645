use chat_proto::{CallSession, MediaToken, Timestamp};
use chatcore::{MediaTokenIssuer, SyncError};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Grant presented to the media server when joining a call's room.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct MediaClaims {
    pub sub: Uuid,
    pub room: String,
    pub call_id: Uuid,
    pub exp: usize,
}

/// Signs media-room grants with the server's HS256 secret.
pub struct JwtMediaTokenIssuer {
    secret: Vec<u8>,
    ttl: Duration,
}

impl JwtMediaTokenIssuer {
    pub fn new(secret: Vec<u8>, ttl: Duration) -> Self {
        Self { secret, ttl }
    }
}

impl MediaTokenIssuer for JwtMediaTokenIssuer {
    fn issue(&self, call: &CallSession, user_id: Uuid, now: Timestamp) -> chatcore::Result<MediaToken> {
        let expires_at = now + self.ttl.as_millis() as i64;
        let claims = MediaClaims {
            sub: user_id,
            room: call.media_room.clone(),
            call_id: call.id,
            exp: (expires_at / 1000) as usize,
        };
        let token = encode(&Header::default(), &claims, &EncodingKey::from_secret(&self.secret))
            .map_err(|e| SyncError::Transport(format!("media token: {e}")))?;
        Ok(MediaToken {
            call_id: call.id,
            media_room: call.media_room.clone(),
            token,
            expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chat_proto::{CallStatus, CallType};
    use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};

    #[test]
    fn token_is_scoped_to_call_room() {
        let issuer = JwtMediaTokenIssuer::new(b"media".to_vec(), Duration::from_secs(600));
        let call = CallSession {
            id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            call_type: CallType::Video,
            caller_id: Uuid::new_v4(),
            media_room: "call-abc".into(),
            status: CallStatus::Ongoing,
            started_at: 0,
            answered_at: None,
            ended_at: None,
            duration_seconds: None,
        };
        let user = Uuid::new_v4();
        let now = time::OffsetDateTime::now_utc().unix_timestamp() * 1000;
        let token = issuer.issue(&call, user, now).unwrap();
        assert_eq!(token.expires_at, now + 600_000);
        let decoded = decode::<MediaClaims>(
            &token.token,
            &DecodingKey::from_secret(b"media"),
            &Validation::new(Algorithm::HS256),
        )
        .unwrap();
        assert_eq!(decoded.claims.sub, user);
        assert_eq!(decoded.claims.room, "call-abc");
        assert_eq!(decoded.claims.call_id, call.id);
    }
}
