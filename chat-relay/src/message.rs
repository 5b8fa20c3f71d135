//! Protocol messages carried inside [`Frame`]s.
//!
//! Field 0 of every frame is one of the [`tag`] constants; the remaining
//! fields depend on the tag.

use thiserror::Error;

use crate::codec::Frame;

pub mod tag {
    /// client → relay: `[display_name]`
    pub const CONNECTION_REQUEST: &str = "SOLICITUD_CONEXION";
    /// relay → client: `[identifier, ...roster]`
    pub const CONNECTION_ACCEPTED: &str = "CONEXION_ACEPTADA";
    /// relay → client: `[identifier]`
    pub const USER_JOINED: &str = "NUEVO_USUARIO_CONECTADO";
    /// client → relay → client: `[sender, recipient, text]`
    pub const DIRECT: &str = "MENSAJE";
    /// client → relay: `[]`
    pub const DISCONNECT_REQUEST: &str = "SOLICITUD_DESCONEXION";
    /// relay → client: `[identifier]`
    pub const USER_LEFT: &str = "USUARIO_DESCONECTADO";
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    ConnectionRequest {
        display_name: String,
    },
    ConnectionAccepted {
        identifier: String,
        roster: Vec<String>,
    },
    UserJoined {
        identifier: String,
    },
    Direct {
        sender: String,
        recipient: String,
        text: String,
    },
    DisconnectRequest,
    UserLeft {
        identifier: String,
    },
}

/// A frame that decoded cleanly but is not a message we understand.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("frame has no tag")]
    MissingTag,
    #[error("unknown message tag {0:?}")]
    UnknownTag(String),
    #[error("{tag} expects {expected} payload fields, got {found}")]
    WrongArity {
        tag: &'static str,
        expected: usize,
        found: usize,
    },
}

impl Message {
    pub fn tag(&self) -> &'static str {
        match self {
            Message::ConnectionRequest { .. } => tag::CONNECTION_REQUEST,
            Message::ConnectionAccepted { .. } => tag::CONNECTION_ACCEPTED,
            Message::UserJoined { .. } => tag::USER_JOINED,
            Message::Direct { .. } => tag::DIRECT,
            Message::DisconnectRequest => tag::DISCONNECT_REQUEST,
            Message::UserLeft { .. } => tag::USER_LEFT,
        }
    }
}

impl From<Message> for Frame {
    fn from(message: Message) -> Self {
        let tag = message.tag().to_string();
        let mut fields = vec![tag];
        match message {
            Message::ConnectionRequest { display_name } => fields.push(display_name),
            Message::ConnectionAccepted { identifier, roster } => {
                fields.push(identifier);
                fields.extend(roster);
            }
            Message::UserJoined { identifier } | Message::UserLeft { identifier } => {
                fields.push(identifier)
            }
            Message::Direct {
                sender,
                recipient,
                text,
            } => fields.extend([sender, recipient, text]),
            Message::DisconnectRequest => {}
        }
        Frame::new(fields)
    }
}

impl TryFrom<Frame> for Message {
    type Error = ProtocolError;

    fn try_from(frame: Frame) -> Result<Self, ProtocolError> {
        let mut fields = frame.into_fields().into_iter();
        let tag = fields.next().ok_or(ProtocolError::MissingTag)?;
        let payload: Vec<String> = fields.collect();

        match tag.as_str() {
            tag::CONNECTION_REQUEST => {
                let [display_name] = exact(tag::CONNECTION_REQUEST, payload)?;
                Ok(Message::ConnectionRequest { display_name })
            }
            tag::CONNECTION_ACCEPTED => {
                let mut payload = payload.into_iter();
                let identifier = payload.next().ok_or(ProtocolError::WrongArity {
                    tag: tag::CONNECTION_ACCEPTED,
                    expected: 1,
                    found: 0,
                })?;
                Ok(Message::ConnectionAccepted {
                    identifier,
                    roster: payload.collect(),
                })
            }
            tag::USER_JOINED => {
                let [identifier] = exact(tag::USER_JOINED, payload)?;
                Ok(Message::UserJoined { identifier })
            }
            tag::DIRECT => {
                let [sender, recipient, text] = exact(tag::DIRECT, payload)?;
                Ok(Message::Direct {
                    sender,
                    recipient,
                    text,
                })
            }
            tag::DISCONNECT_REQUEST => {
                exact::<0>(tag::DISCONNECT_REQUEST, payload)?;
                Ok(Message::DisconnectRequest)
            }
            tag::USER_LEFT => {
                let [identifier] = exact(tag::USER_LEFT, payload)?;
                Ok(Message::UserLeft { identifier })
            }
            _ => Err(ProtocolError::UnknownTag(tag)),
        }
    }
}

fn exact<const N: usize>(
    tag: &'static str,
    payload: Vec<String>,
) -> Result<[String; N], ProtocolError> {
    let found = payload.len();
    payload.try_into().map_err(|_| ProtocolError::WrongArity {
        tag,
        expected: N,
        found,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(fields: &[&str]) -> Frame {
        fields.iter().copied().collect()
    }

    #[test]
    fn parses_every_tag() {
        let cases = [
            (
                frame(&["SOLICITUD_CONEXION", "Ana"]),
                Message::ConnectionRequest {
                    display_name: "Ana".into(),
                },
            ),
            (
                frame(&["CONEXION_ACEPTADA", "2 - Beto", "1 - Ana"]),
                Message::ConnectionAccepted {
                    identifier: "2 - Beto".into(),
                    roster: vec!["1 - Ana".into()],
                },
            ),
            (
                frame(&["NUEVO_USUARIO_CONECTADO", "2 - Beto"]),
                Message::UserJoined {
                    identifier: "2 - Beto".into(),
                },
            ),
            (
                frame(&["MENSAJE", "1 - Ana", "2 - Beto", "hola"]),
                Message::Direct {
                    sender: "1 - Ana".into(),
                    recipient: "2 - Beto".into(),
                    text: "hola".into(),
                },
            ),
            (
                frame(&["SOLICITUD_DESCONEXION"]),
                Message::DisconnectRequest,
            ),
            (
                frame(&["USUARIO_DESCONECTADO", "2 - Beto"]),
                Message::UserLeft {
                    identifier: "2 - Beto".into(),
                },
            ),
        ];

        for (raw, expected) in cases {
            let parsed = Message::try_from(raw.clone()).expect("valid frame");
            assert_eq!(parsed, expected);
            assert_eq!(Frame::from(parsed), raw);
        }
    }

    #[test]
    fn accepted_with_empty_roster() {
        let parsed = Message::try_from(frame(&["CONEXION_ACEPTADA", "1 - Ana"])).expect("valid");
        assert_eq!(
            parsed,
            Message::ConnectionAccepted {
                identifier: "1 - Ana".into(),
                roster: vec![],
            }
        );
    }

    #[test]
    fn unknown_tag_is_a_protocol_error() {
        assert_eq!(
            Message::try_from(frame(&["PING"])),
            Err(ProtocolError::UnknownTag("PING".into()))
        );
    }

    #[test]
    fn wrong_arity_is_a_protocol_error() {
        assert!(matches!(
            Message::try_from(frame(&["MENSAJE", "1 - Ana", "2 - Beto"])),
            Err(ProtocolError::WrongArity {
                tag: tag::DIRECT,
                found: 2,
                ..
            })
        ));
        assert!(matches!(
            Message::try_from(frame(&["SOLICITUD_DESCONEXION", "extra"])),
            Err(ProtocolError::WrongArity { found: 1, .. })
        ));
        assert!(matches!(
            Message::try_from(frame(&["CONEXION_ACEPTADA"])),
            Err(ProtocolError::WrongArity { found: 0, .. })
        ));
    }

    #[test]
    fn empty_frame_has_no_tag() {
        assert_eq!(
            Message::try_from(Frame::default()),
            Err(ProtocolError::MissingTag)
        );
    }
}
