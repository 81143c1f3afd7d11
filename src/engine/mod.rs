pub mod dispatch;
pub mod presence;
pub mod pricing;
pub mod proximity;
pub mod timers;
pub mod validator;
