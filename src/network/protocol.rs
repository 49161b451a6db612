//! Текстовый line-протокол сервиса.
//!
//! Одна команда на строку, аргументы разделены пробелами. Ответы в стиле
//! RESP: `+` простая строка, `:` целое, `$` bulk-строка (`$-1` это nil),
//! `*` массив, `-ERR <code> <message>` ошибка.

use std::fmt::Write as _;

use fleetgeo_error::{ErrorExt, ProtocolError, StatusCode};

use crate::database::DistanceUnit;

/// Разобранная команда.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Ping(Option<String>),
    Upsert {
        agent_id: String,
        latitude: f64,
        longitude: f64,
    },
    Nearby {
        latitude: f64,
        longitude: f64,
        radius_km: f64,
        /// `0`, если лимит не указан.
        limit: i64,
        with_dist: bool,
    },
    Remove {
        agent_id: String,
    },
    Pos {
        agent_id: String,
    },
    Dist {
        a: String,
        b: String,
        unit: DistanceUnit,
    },
    Count,
    Quit,
}

/// Ответ сервера.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Simple(String),
    Integer(i64),
    Bulk(String),
    Nil,
    Array(Vec<Reply>),
    Error { code: StatusCode, message: String },
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl Command {
    /// Разбирает строку команды. Имя команды регистронезависимо.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let mut parts = line.split_whitespace();
        let Some(name) = parts.next() else {
            return Err(ProtocolError::EmptyCommand);
        };
        let args: Vec<&str> = parts.collect();

        match name.to_ascii_uppercase().as_str() {
            "PING" => {
                expect_args("PING", "0..=1", &args, 0..=1)?;
                Ok(Command::Ping(args.first().map(|s| s.to_string())))
            }
            "UPSERT" => {
                expect_args("UPSERT", "3", &args, 3..=3)?;
                Ok(Command::Upsert {
                    agent_id: args[0].to_string(),
                    latitude: parse_float("latitude", args[1])?,
                    longitude: parse_float("longitude", args[2])?,
                })
            }
            "NEARBY" => {
                expect_args("NEARBY", "3..=5", &args, 3..=5)?;
                let mut limit = None;
                let mut with_dist = false;
                for arg in &args[3..] {
                    if arg.eq_ignore_ascii_case("WITHDIST") && !with_dist {
                        with_dist = true;
                    } else if limit.is_none() && !arg.eq_ignore_ascii_case("WITHDIST") {
                        limit = Some(parse_int("limit", arg)?);
                    } else {
                        return Err(ProtocolError::UnknownOption {
                            command: "NEARBY",
                            option: arg.to_string(),
                        });
                    }
                }
                Ok(Command::Nearby {
                    latitude: parse_float("latitude", args[0])?,
                    longitude: parse_float("longitude", args[1])?,
                    radius_km: parse_float("radius", args[2])?,
                    limit: limit.unwrap_or(0),
                    with_dist,
                })
            }
            "REMOVE" => {
                expect_args("REMOVE", "1", &args, 1..=1)?;
                Ok(Command::Remove {
                    agent_id: args[0].to_string(),
                })
            }
            "POS" => {
                expect_args("POS", "1", &args, 1..=1)?;
                Ok(Command::Pos {
                    agent_id: args[0].to_string(),
                })
            }
            "DIST" => {
                expect_args("DIST", "2..=3", &args, 2..=3)?;
                let unit = match args.get(2) {
                    Some(unit) => unit.parse()?,
                    None => DistanceUnit::Kilometers,
                };
                Ok(Command::Dist {
                    a: args[0].to_string(),
                    b: args[1].to_string(),
                    unit,
                })
            }
            "COUNT" => {
                expect_args("COUNT", "0", &args, 0..=0)?;
                Ok(Command::Count)
            }
            "QUIT" => Ok(Command::Quit),
            _ => Err(ProtocolError::UnknownCommand {
                command: name.to_string(),
            }),
        }
    }

    /// Имя команды для логов.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Ping(_) => "PING",
            Command::Upsert { .. } => "UPSERT",
            Command::Nearby { .. } => "NEARBY",
            Command::Remove { .. } => "REMOVE",
            Command::Pos { .. } => "POS",
            Command::Dist { .. } => "DIST",
            Command::Count => "COUNT",
            Command::Quit => "QUIT",
        }
    }
}

impl Reply {
    pub fn ok() -> Self {
        Reply::Simple("OK".to_string())
    }

    /// Ответ-ошибка: код статуса и безопасное для клиента сообщение.
    pub fn from_error(err: &dyn ErrorExt) -> Self {
        Reply::Error {
            code: err.status_code(),
            message: err.client_message(),
        }
    }

    /// Число в текстовом виде с 4 знаками после запятой.
    pub fn float(value: f64) -> Self {
        Reply::Bulk(format!("{value:.4}"))
    }

    pub fn encode(&self) -> String {
        let mut out = String::new();
        self.encode_into(&mut out);
        out
    }

    fn encode_into(
        &self,
        out: &mut String,
    ) {
        // write! в String не может вернуть ошибку
        let _ = match self {
            Reply::Simple(s) => write!(out, "+{}\r\n", sanitize(s)),
            Reply::Integer(n) => write!(out, ":{n}\r\n"),
            Reply::Bulk(s) => write!(out, "${}\r\n{s}\r\n", s.len()),
            Reply::Nil => write!(out, "$-1\r\n"),
            Reply::Array(items) => {
                let _ = write!(out, "*{}\r\n", items.len());
                for item in items {
                    item.encode_into(out);
                }
                Ok(())
            }
            Reply::Error { code, message } => {
                write!(out, "-ERR {} {}\r\n", code.code(), sanitize(message))
            }
        };
    }
}

////////////////////////////////////////////////////////////////////////////////
// Внутренние методы и функции
////////////////////////////////////////////////////////////////////////////////

fn expect_args(
    command: &'static str,
    expected: &'static str,
    args: &[&str],
    range: std::ops::RangeInclusive<usize>,
) -> Result<(), ProtocolError> {
    if range.contains(&args.len()) {
        Ok(())
    } else {
        Err(ProtocolError::WrongArgCount {
            command,
            expected,
            actual: args.len(),
        })
    }
}

fn parse_float(
    field: &'static str,
    value: &str,
) -> Result<f64, ProtocolError> {
    value.parse().map_err(|_| ProtocolError::InvalidFloat {
        field,
        value: value.to_string(),
    })
}

fn parse_int(
    field: &'static str,
    value: &str,
) -> Result<i64, ProtocolError> {
    value.parse().map_err(|_| ProtocolError::InvalidInteger {
        field,
        value: value.to_string(),
    })
}

/// Простые строки и ошибки не могут содержать перевод строки.
fn sanitize(s: &str) -> String {
    s.replace(['\r', '\n'], " ")
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////
