use async_trait::async_trait;
use queue_models::{Credential, RoundId, TeamId};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};
use thiserror::Error;

use crate::outcome::{Outcome, ProbeEnv};
use crate::probe::*;
use crate::runner::Runner;
use crate::service::{Service, ServiceDefaults, VerifyError};

/// Type tag of a service, as used in the configuration and in tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter)]
pub enum ServiceType {
    Custom,
    Dns,
    Ftp,
    Imap,
    Ldap,
    Ping,
    Pop3,
    Rdp,
    Smb,
    Smtp,
    Sql,
    Ssh,
    Tcp,
    Vnc,
    Web,
    #[strum(serialize = "WinRM")]
    WinRm,
}

impl ServiceType {
    pub fn default_display(self) -> String {
        self.to_string().to_lowercase()
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown service type {0:?}")]
    UnknownType(String),
    #[error("malformed check data for {service_type}")]
    MalformedCheckData {
        service_type: ServiceType,
        #[source]
        source: serde_json::Error,
    },
}

macro_rules! registry {
    ($($variant:ident($key:literal) $field:ident: $probe:ty),* $(,)?) => {
        /// A configured service of any kind.
        #[derive(Debug, Clone, PartialEq, Serialize)]
        #[serde(untagged)]
        pub enum Check {
            $($variant($probe)),*
        }

        impl Check {
            fn from_value(
                service_type: ServiceType,
                check_data: serde_json::Value,
            ) -> Result<Self, serde_json::Error> {
                match service_type {
                    $(ServiceType::$variant => serde_json::from_value(check_data).map(Check::$variant)),*
                }
            }

            fn runner(&self) -> &dyn Runner {
                match self {
                    $(Check::$variant(it) => it),*
                }
            }

            fn runner_mut(&mut self) -> &mut dyn Runner {
                match self {
                    $(Check::$variant(it) => it),*
                }
            }
        }

        /// The per-type service arrays of a box in the configuration file.
        #[derive(Debug, Clone, Default, Deserialize)]
        pub struct ServiceLists {
            $(
                #[serde(default, rename = $key)]
                pub $field: Vec<$probe>,
            )*
        }

        impl ServiceLists {
            pub fn into_checks(self) -> Vec<Check> {
                let mut checks = vec![];
                $(checks.extend(self.$field.into_iter().map(Check::$variant));)*
                checks
            }
        }
    };
}

registry! {
    Custom("Custom") custom: Custom,
    Dns("Dns") dns: Dns,
    Ftp("Ftp") ftp: Ftp,
    Imap("Imap") imap: Imap,
    Ldap("Ldap") ldap: Ldap,
    Ping("Ping") ping: Ping,
    Pop3("Pop3") pop3: Pop3,
    Rdp("Rdp") rdp: Rdp,
    Smb("Smb") smb: Smb,
    Smtp("Smtp") smtp: Smtp,
    Sql("Sql") sql: Sql,
    Ssh("Ssh") ssh: Ssh,
    Tcp("Tcp") tcp: Tcp,
    Vnc("Vnc") vnc: Vnc,
    Web("Web") web: Web,
    WinRm("WinRM") winrm: WinRm,
}

/// Rebuilds a probe from the type tag and check data of a task.
pub fn build(service_type: &str, check_data: serde_json::Value) -> Result<Check, RegistryError> {
    let service_type: ServiceType = service_type
        .parse()
        .map_err(|_| RegistryError::UnknownType(service_type.to_string()))?;
    Check::from_value(service_type, check_data).map_err(|source| {
        RegistryError::MalformedCheckData {
            service_type,
            source,
        }
    })
}

impl Check {
    /// The JSON that [build] accepts back.
    pub fn check_data(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }
}

#[async_trait]
impl Runner for Check {
    async fn run(
        &self,
        team_id: TeamId,
        team_identifier: &str,
        round_id: RoundId,
        env: &ProbeEnv,
    ) -> Outcome {
        self.runner()
            .run(team_id, team_identifier, round_id, env)
            .await
    }

    fn verify(
        &mut self,
        box_name: &str,
        ip: &str,
        defaults: &ServiceDefaults,
    ) -> Result<(), VerifyError> {
        self.runner_mut().verify(box_name, ip, defaults)
    }

    fn service_type(&self) -> ServiceType {
        self.runner().service_type()
    }

    fn service(&self) -> &Service {
        self.runner().service()
    }

    fn set_task_credentials(&mut self, credentials: Vec<Credential>) {
        self.runner_mut().set_task_credentials(credentials)
    }
}
