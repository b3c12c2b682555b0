use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use super::{CompletionToken, GpuDevice, TextureDesc, TextureId};
use crate::RendererError;

const DROP_WAIT: Duration = Duration::from_millis(500);

/// Proof that a texture has no unresolved uses. Only [`GpuTexture`] can
/// construct one, so a backend cannot be asked to free a busy texture.
#[derive(Debug)]
pub struct Retired {
    id: TextureId,
}

impl Retired {
    pub fn id(&self) -> TextureId {
        self.id
    }
}

/// Owns one device texture and the completion tokens of work that uses it.
///
/// The texture is destroyed exactly once, either through [`GpuTexture::release`]
/// or on drop, and never while a tracked token is unresolved.
pub struct GpuTexture {
    id: TextureId,
    desc: TextureDesc,
    device: Arc<dyn GpuDevice>,
    uses: Mutex<Vec<CompletionToken>>,
    released: bool,
}

impl std::fmt::Debug for GpuTexture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuTexture")
            .field("id", &self.id)
            .field("desc", &self.desc)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

impl GpuTexture {
    pub fn create(device: &Arc<dyn GpuDevice>, desc: TextureDesc) -> Result<Self, RendererError> {
        let id = device.create_texture(&desc)?;
        Ok(Self {
            id,
            desc,
            device: device.clone(),
            uses: Mutex::new(Vec::new()),
            released: false,
        })
    }

    pub fn id(&self) -> TextureId {
        self.id
    }

    pub fn desc(&self) -> &TextureDesc {
        &self.desc
    }

    /// Records that submitted work reads or writes this texture.
    pub fn mark_used(&self, token: &CompletionToken) {
        let mut uses = self.uses.lock();
        uses.retain(|t| !t.is_complete());
        if !token.is_complete() {
            uses.push(token.clone());
        }
    }

    pub fn outstanding(&self) -> usize {
        self.uses.lock().iter().filter(|t| !t.is_complete()).count()
    }

    pub fn is_idle(&self) -> bool {
        self.outstanding() == 0
    }

    /// Waits up to `timeout` for every tracked use, then frees the texture.
    /// Hands the texture back if some use is still unresolved.
    pub fn release(mut self, timeout: Duration) -> Result<(), GpuTexture> {
        if self.wait_idle(timeout) {
            self.retire();
            Ok(())
        } else {
            Err(self)
        }
    }

    /// Frees the texture only if it is already idle.
    pub fn try_release(self) -> Result<(), GpuTexture> {
        self.release(Duration::ZERO)
    }

    fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let pending: Vec<_> = self.uses.lock().clone();
        for token in &pending {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !self.device.wait_for(token, remaining) {
                return false;
            }
        }
        self.uses.lock().clear();
        true
    }

    fn retire(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        debug!(id = self.id.0, label = self.desc.label, "[gpu] texture released");
        self.device.destroy_texture(Retired { id: self.id });
    }

    /// Gives up on the texture without freeing it.
    fn leak(mut self) {
        error!(
            id = self.id.0,
            label = self.desc.label,
            outstanding = self.outstanding(),
            "[gpu] leaking texture with unresolved completion"
        );
        self.released = true;
    }
}

impl Drop for GpuTexture {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if self.wait_idle(DROP_WAIT) {
            self.retire();
        } else {
            error!(
                id = self.id.0,
                label = self.desc.label,
                "[gpu] texture dropped while in use, leaking it"
            );
            self.released = true;
        }
    }
}

/// Textures whose uses did not resolve in time, freed once they go idle.
#[derive(Debug, Default)]
pub struct ReleaseQueue {
    parked: Mutex<Vec<GpuTexture>>,
}

impl ReleaseQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn park(&self, texture: GpuTexture) {
        warn!(
            id = texture.id().0,
            label = texture.desc().label,
            "[gpu] texture still in use, deferring release"
        );
        self.parked.lock().push(texture);
    }

    pub fn len(&self) -> usize {
        self.parked.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Frees every parked texture that has gone idle, without blocking.
    pub fn collect(&self) -> usize {
        let parked = std::mem::take(&mut *self.parked.lock());
        let mut freed = 0;
        let mut still_busy = Vec::new();
        for texture in parked {
            match texture.try_release() {
                Ok(()) => freed += 1,
                Err(texture) => still_busy.push(texture),
            }
        }
        self.parked.lock().extend(still_busy);
        freed
    }

    /// Waits up to `timeout` per texture; anything still busy is leaked.
    pub fn drain(&self, timeout: Duration) -> usize {
        let parked = std::mem::take(&mut *self.parked.lock());
        let mut leaked = 0;
        for texture in parked {
            if let Err(texture) = texture.release(timeout) {
                texture.leak();
                leaked += 1;
            }
        }
        leaked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{HeadlessConfig, HeadlessDevice, TextureFormat};

    fn desc() -> TextureDesc {
        TextureDesc {
            label: "test",
            width: 4,
            height: 4,
            format: TextureFormat::R8,
        }
    }

    #[test]
    fn idle_texture_releases_immediately() {
        let headless = Arc::new(HeadlessDevice::new(HeadlessConfig::default()));
        let device: Arc<dyn GpuDevice> = headless.clone();
        let texture = GpuTexture::create(&device, desc()).expect("texture");
        assert_eq!(headless.live_textures(), 1);
        texture.release(Duration::ZERO).expect("released");
        assert_eq!(headless.live_textures(), 0);
        assert_eq!(headless.destroy_violations(), 0);
    }

    #[test]
    fn busy_texture_is_parked_until_idle() {
        let headless = Arc::new(HeadlessDevice::new(HeadlessConfig::default()));
        let device: Arc<dyn GpuDevice> = headless.clone();
        let texture = GpuTexture::create(&device, desc()).expect("texture");
        headless.set_deferred(true);
        let token = device.fill_texture(texture.id(), [16, 0, 0, 0]).expect("fill");
        texture.mark_used(&token);

        let queue = ReleaseQueue::new();
        match texture.release(Duration::from_millis(5)) {
            Ok(()) => panic!("texture released while in use"),
            Err(texture) => queue.park(texture),
        }
        assert_eq!(queue.collect(), 0);
        assert_eq!(headless.live_textures(), 1);

        headless.complete_deferred();
        assert_eq!(queue.collect(), 1);
        assert!(queue.is_empty());
        assert_eq!(headless.live_textures(), 0);
        assert_eq!(headless.destroy_violations(), 0);
    }
}
