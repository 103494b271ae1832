//! Switchyard engine: endpoints, components, the pipeline executor, the
//! route DSL, and route lifecycle management.
//!
//! ```ignore
//! let ctx = SwitchyardContext::new();
//! ctx.add_routes([RouteBuilder::from("direct:greet")
//!     .set_body("Hello ${body}")
//!     .to("log:greetings")])
//!     .await?;
//! ctx.start().await?;
//! let reply = ctx.producer_template().request_body("direct:greet", "World").await?;
//! ```

pub mod bean;
pub mod component;
pub mod config;
pub mod context;
pub mod endpoint;
pub mod error;
pub mod processor;
pub mod properties;
pub mod registry;
pub mod route;
pub mod template;
pub mod worker;

pub use bean::{Bean, BeanArgs, BeanMethod, BeanRegistry, ParamBinding};
pub use component::feed::{ChangeEvent, ChangeFeed, ChangeKind};
pub use component::mock::MockEndpoint;
pub use config::{BackpressureMode, EngineConfig, RetryConfig};
pub use context::SwitchyardContext;
pub use endpoint::{Component, Consumer, Endpoint, EndpointRegistry, Producer};
pub use error::EngineError;
pub use processor::{AggregationStrategy, Processor, RedeliveryPolicy};
pub use properties::{CompositeProperties, EnvProperties, MapProperties, PropertiesSource};
pub use registry::Registry;
pub use route::{RouteBuilder, RouteHealth, RouteStatsSnapshot, RouteStatus, Steps, StepsDsl};
pub use template::ProducerTemplate;

pub use switchyard_core as core;
