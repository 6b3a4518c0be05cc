//! gomote-services: Session pool, rendezvous, buildlet clients, SSH
//! authentication and the gomote service façade.

pub mod buildlet;
pub mod github_keys;
pub mod gomote_service;
pub mod periodic;
pub mod rendezvous;
pub mod reverse;
pub mod scheduler;
pub mod session;
pub mod ssh_auth;
pub mod status;
pub mod token;

pub use buildlet::{BuildletClient, BuildletError, FakeBuildlet};
pub use gomote_service::{GomoteService, GomoteServiceConfig};
pub use rendezvous::{Rendezvous, RendezvousError, ReverseRejection, ReverseRequest, ReverseSlot};
pub use session::{SessionPool, SessionPoolConfig, SessionView};
pub use status::{Code, Status};
