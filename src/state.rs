use crate::cache::CacheFacade;
use crate::config::Config;
use crate::events::InvalidationDispatcher;
use crate::filters::MembershipFilters;
use std::sync::Arc;

pub struct AppState {
    pub config: Config,
    pub cache: CacheFacade,
    pub filters: Arc<MembershipFilters>,
    pub dispatcher: Arc<InvalidationDispatcher>,
}
