//! OS keyring integration for carrier/provider/calendar/SMS secrets (§10.3).

pub mod keyring;
