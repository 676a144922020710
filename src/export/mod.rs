pub mod health;

pub use self::health::ActuatorMetrics;
