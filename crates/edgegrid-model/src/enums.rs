//! Enumerations shared across the object model.
//!
//! Every enum here parses from its camel-case name, its underscore or
//! dash-separated form (any case), and its integer representation, and
//! formats back to the camel-case name. `parsed_enum!` generates that
//! surface once so the types stay declarative.

use crate::error::ModelError;
use serde::{Deserialize, Serialize};

macro_rules! parsed_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $num:expr ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $( $(#[$vmeta])* $variant = $num ),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[ $( $name::$variant ),+ ];

            /// Camel-case name of the variant.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $( $name::$variant => stringify!($variant) ),+
                }
            }

            /// Integer representation.
            pub fn as_index(&self) -> i32 {
                *self as i32
            }

            pub fn from_index(idx: i32) -> Option<Self> {
                match idx {
                    $( $num => Some($name::$variant), )+
                    _ => None,
                }
            }

            /// Parse from the camel-case name, a separator-stripped form
            /// in any case, or the integer representation.
            pub fn parse(s: &str) -> Option<Self> {
                if let Ok(idx) = s.parse::<i32>() {
                    return Self::from_index(idx);
                }
                let folded: String = s
                    .chars()
                    .filter(|c| *c != '_' && *c != '-')
                    .flat_map(|c| c.to_lowercase())
                    .collect();
                $(
                    if folded == stringify!($variant).to_lowercase() {
                        return Some($name::$variant);
                    }
                )+
                None
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::ALL[0]
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = ModelError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s).ok_or_else(|| {
                    ModelError::InvalidArg(format!(
                        "unknown {} value {:?}",
                        stringify!($name),
                        s
                    ))
                })
            }
        }
    };
}

parsed_enum! {
    /// Lifecycle state of AppInst, ClusterInst, and Cloudlet objects.
    /// Transitions are driven by the controller and the site CRM.
    pub enum TrackedState {
        Unknown = 0,
        NotPresent = 1,
        CreateRequested = 2,
        Creating = 3,
        CreateError = 4,
        Ready = 5,
        UpdateRequested = 6,
        Updating = 7,
        UpdateError = 8,
        DeleteRequested = 9,
        Deleting = 10,
        DeleteError = 11,
        DeletePrepare = 12,
        CrmInitOk = 13,
    }
}

impl TrackedState {
    /// States that represent in-flight work. A delete is refused while the
    /// object is transient unless the caller overrides transient state.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TrackedState::CreateRequested
                | TrackedState::Creating
                | TrackedState::UpdateRequested
                | TrackedState::Updating
                | TrackedState::DeleteRequested
                | TrackedState::Deleting
                | TrackedState::DeletePrepare
                | TrackedState::CrmInitOk
        )
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            TrackedState::CreateError | TrackedState::UpdateError | TrackedState::DeleteError
        )
    }

    /// The error state that corresponds to a failed in-flight operation.
    pub fn error_state(&self) -> TrackedState {
        match self {
            TrackedState::CreateRequested | TrackedState::Creating => TrackedState::CreateError,
            TrackedState::UpdateRequested | TrackedState::Updating => TrackedState::UpdateError,
            TrackedState::DeleteRequested | TrackedState::Deleting => TrackedState::DeleteError,
            _ => TrackedState::Unknown,
        }
    }
}

parsed_enum! {
    /// Site-reported cloudlet health, carried on CloudletInfo.
    pub enum CloudletState {
        Unknown = 0,
        Errors = 1,
        Ready = 2,
        Offline = 3,
        NotPresent = 4,
        Init = 5,
        Upgrade = 6,
    }
}

parsed_enum! {
    /// Operator-controlled maintenance mode of a cloudlet.
    pub enum MaintenanceState {
        NormalOperation = 0,
        MaintenanceStart = 1,
        UnderMaintenance = 2,
    }
}

parsed_enum! {
    /// Overrides for CRM interaction on lifecycle operations. Used by
    /// operators to recover objects when the site is unreachable or stuck.
    pub enum CrmOverride {
        NoOverride = 0,
        IgnoreCrm = 1,
        IgnoreCrmErrors = 2,
        IgnoreTransientState = 3,
        IgnoreCrmAndTransientState = 4,
    }
}

impl CrmOverride {
    pub fn skips_crm(&self) -> bool {
        matches!(
            self,
            CrmOverride::IgnoreCrm | CrmOverride::IgnoreCrmAndTransientState
        )
    }

    pub fn ignores_crm_errors(&self) -> bool {
        matches!(self, CrmOverride::IgnoreCrmErrors)
    }

    pub fn ignores_transient_state(&self) -> bool {
        matches!(
            self,
            CrmOverride::IgnoreTransientState | CrmOverride::IgnoreCrmAndTransientState
        )
    }
}

parsed_enum! {
    /// How an App's workload is deployed on a cluster or cloudlet.
    pub enum DeploymentType {
        Kubernetes = 0,
        Docker = 1,
        Helm = 2,
        Vm = 3,
    }
}

impl DeploymentType {
    /// Deployments realized inside a Kubernetes cluster.
    pub fn deploys_to_kubernetes(&self) -> bool {
        matches!(self, DeploymentType::Kubernetes | DeploymentType::Helm)
    }

    /// Deployments that need a ClusterInst at all.
    pub fn needs_cluster(&self) -> bool {
        !matches!(self, DeploymentType::Vm)
    }
}

parsed_enum! {
    /// How the load balancer IP is allocated for an instance.
    pub enum IpAccess {
        Unknown = 0,
        Dedicated = 1,
        Shared = 2,
    }
}

parsed_enum! {
    /// How an AppInst came to exist, which controls auto-delete rules.
    pub enum Liveness {
        Unknown = 0,
        Static = 1,
        Dynamic = 2,
        Autoprov = 3,
    }
}

parsed_enum! {
    /// Delete option: auto-delete children are removed by their parent's
    /// delete instead of blocking it.
    pub enum DelOpt {
        NoAutoDelete = 0,
        AutoDelete = 1,
    }
}
