use std::{
    env,
    fmt::{Display, Formatter, Result},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Environment {
    #[default]
    Local,
    Dev,
    Staging,
    Prod,
}

impl Display for Environment {
    fn fmt(&self, f: &mut Formatter) -> Result {
        let printable = match *self {
            Environment::Local => "local",
            Environment::Dev => "development",
            Environment::Staging => "staging",
            Environment::Prod => "prod",
        };
        write!(f, "{}", printable)
    }
}

impl Environment {
    pub fn from_rust_env() -> Environment {
        Environment::from_name(&env::var("RUST_ENV").unwrap_or_default())
    }

    pub fn from_name(name: &str) -> Environment {
        match name {
            "production" | "prod" | "PRODUCTION" | "PROD" => Environment::Prod,
            "staging" | "stg" | "STAGING" | "STG" => Environment::Staging,
            "develop" | "DEVELOP" | "dev" | "DEV" => Environment::Dev,
            _ => Environment::Local,
        }
    }

    pub fn is_local(&self) -> bool {
        self == &Environment::Local
    }

    pub fn is_prod(&self) -> bool {
        self == &Environment::Prod
    }
}
