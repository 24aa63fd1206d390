mod bus;
mod local;
mod metadata;
mod nodes;
mod routing;
mod state;

pub use bus::{
    ClusterChangedEvent, ClusterStateApplier, ClusterStateBus, Priority, PublicationError,
    UpdateTask,
};
pub use local::LocalBus;
pub use metadata::{DataStream, IndexMetadata, Metadata, RepositoryMetadata};
pub use nodes::{DiscoveryNode, DiscoveryNodes};
pub use routing::{IndexRoutingTable, RoutingTable, ShardRouting, ShardRoutingState};
pub use state::ClusterState;
