/// Client facade.
///
/// `ShimClient` ties the layers together: one transport handle, one
/// authentication context and one transfer engine. Every array operation
/// logs in if needed, takes a fresh session for its own duration and hands
/// the session back before returning, whatever the outcome.
use crate::config::ClientConfig;
use crate::error::ShimResult;
use crate::model::{ArrayMetadata, AttributeStats, Rectangle, SpatialReference};
use crate::query;
use crate::resolver;
use crate::session::{AuthContext, SessionManager};
use crate::transfer::TransferEngine;
use crate::transport::{Gateway, HttpGateway, Transport};
use tracing::{info, instrument, warn};

pub struct ShimClient<G: Gateway = HttpGateway> {
    transport: Transport<G>,
    sessions: SessionManager,
    transfer: TransferEngine,
}

impl ShimClient<HttpGateway> {
    /// Create a client talking HTTP to the gateway named in `config`.
    ///
    /// No request is sent until the first operation.
    pub fn new(config: ClientConfig) -> ShimResult<ShimClient<HttpGateway>> {
        let gateway = HttpGateway::new(&config)?;
        Ok(ShimClient::with_gateway(gateway, &config))
    }
}

impl<G: Gateway> ShimClient<G> {
    /// Create a client over an arbitrary wire backend.
    pub fn with_gateway(gateway: G, config: &ClientConfig) -> ShimClient<G> {
        ShimClient {
            transport: Transport::new(gateway, config.attempts, config.retry_backoff),
            sessions: SessionManager::new(config.connection.clone()),
            transfer: TransferEngine::new(config.scratch),
        }
    }

    pub fn transport(&self) -> &Transport<G> {
        &self.transport
    }

    pub fn auth_context(&self) -> Option<&AuthContext> {
        self.sessions.auth_context()
    }

    /// Gateway version string. Needs neither login nor session.
    pub fn test_connection(&self) -> ShimResult<String> {
        self.transport.test_connection()
    }

    pub fn ensure_authenticated(&mut self) -> ShimResult<()> {
        self.sessions.ensure_authenticated(&self.transport)
    }

    pub fn logout(&mut self) -> ShimResult<()> {
        self.sessions.logout(&self.transport)
    }

    /// Resolve the complete metadata of an existing array.
    #[instrument(skip(self))]
    pub fn describe(&mut self, name: &str) -> ShimResult<ArrayMetadata> {
        self.ensure_authenticated()?;
        let session = self.sessions.open(&self.transport)?;
        resolver::describe(&session, name)
    }

    #[instrument(skip(self))]
    pub fn array_exists(&mut self, name: &str) -> ShimResult<bool> {
        self.ensure_authenticated()?;
        let session = self.sessions.open(&self.transport)?;
        resolver::array_exists(&session, name)
    }

    /// Create the array described by `meta`.
    ///
    /// # Arguments
    ///
    /// * `meta` - Name, attributes and dimensions of the new array
    /// * `temporary` - Create a temporary (unversioned) array
    ///
    #[instrument(skip(self, meta), fields(array = %meta.name()))]
    pub fn create_array(&mut self, meta: &ArrayMetadata, temporary: bool) -> ShimResult<()> {
        let query = query::create_array(meta, temporary)?;
        self.ensure_authenticated()?;
        let session = self.sessions.open(&self.transport)?;
        session.execute(&query)?;
        info!(schema = %query.text, "Created array");
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn remove_array(&mut self, name: &str) -> ShimResult<()> {
        let query = query::remove_array(name)?;
        self.ensure_authenticated()?;
        let session = self.sessions.open(&self.transport)?;
        session.execute(&query)?;
        info!("Removed array");
        Ok(())
    }

    /// Store the contents of `source` into `destination`.
    #[instrument(skip(self))]
    pub fn copy_array(&mut self, source: &str, destination: &str) -> ShimResult<()> {
        let query = query::copy_array(source, destination)?;
        self.ensure_authenticated()?;
        let session = self.sessions.open(&self.transport)?;
        session.execute(&query)
    }

    /// Read attribute `attribute` of `rect` into `buf`.
    ///
    /// `buf` is sized for the full rectangle, row-major in the array's native
    /// dimension order. Cells outside the array are left as they were.
    pub fn read(
        &mut self,
        meta: &ArrayMetadata,
        attribute: usize,
        rect: Rectangle,
        buf: &mut [u8],
    ) -> ShimResult<()> {
        self.ensure_authenticated()?;
        let session = self.sessions.open(&self.transport)?;
        self.transfer.read(&session, meta, attribute, rect, buf)
    }

    /// Write full records of `rect` from `buf`. Cells outside the array are
    /// dropped.
    pub fn write(&mut self, meta: &ArrayMetadata, rect: Rectangle, buf: &[u8]) -> ShimResult<()> {
        self.ensure_authenticated()?;
        let session = self.sessions.open(&self.transport)?;
        self.transfer.write(&session, meta, rect, buf)
    }

    /// Attach `srs` to the remote array, then to `meta`.
    ///
    /// `meta` is only touched once the gateway accepted the update, which
    /// also re-resolves its axes.
    #[instrument(skip(self, meta, srs), fields(array = %meta.name()))]
    pub fn update_spatial_reference(
        &mut self,
        meta: &mut ArrayMetadata,
        srs: SpatialReference,
    ) -> ShimResult<()> {
        let query = query::update_spatial_reference(meta.name(), &srs)?;
        self.ensure_authenticated()?;
        {
            let session = self.sessions.open(&self.transport)?;
            session.execute(&query)?;
        }
        info!(authority = %srs.authority_name, srid = srs.authority_srid, "Updated spatial reference");
        meta.set_spatial_reference(Some(srs));
        Ok(())
    }

    #[instrument(skip(self, meta), fields(array = %meta.name()))]
    pub fn attribute_stats(&mut self, meta: &ArrayMetadata, attribute: usize) -> ShimResult<AttributeStats> {
        let query = query::attribute_stats(meta, attribute)?;
        self.ensure_authenticated()?;
        let session = self.sessions.open(&self.transport)?;
        resolver::parse_stats(&resolver::fetch_lines(&session, &query)?)
    }

    /// Bytes the transfer engine holds for boundary fragments.
    pub fn scratch_capacity(&self) -> usize {
        self.transfer.scratch_capacity()
    }
}

impl<G: Gateway> Drop for ShimClient<G> {
    fn drop(&mut self) {
        if let Err(e) = self.sessions.logout(&self.transport) {
            warn!(error = %e, "Logout on drop failed");
        }
    }
}
