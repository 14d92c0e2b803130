pub mod funnel;
pub mod health;
