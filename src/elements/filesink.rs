use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use log::{debug, info};
use std::io::SeekFrom;
use std::path::PathBuf;
use tokio::fs::{self, File};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use crate::pipeline::caps::{Caps, Pads};
use crate::pipeline::stage::{Stage, StageContext, StageOptions};
use crate::pipeline::types::Buffer;

/// Writes every buffer to a file
///
/// Buffers carrying an offset overwrite that position and writing then
/// continues at the end of the file.
pub struct FileSink {
    location: PathBuf,
    file: Option<File>,
    written: u64,
    name: String,
}

impl FileSink {
    pub fn from_options(options: &StageOptions) -> Result<Self> {
        let location = options
            .get("location")
            .filter(|l| !l.is_empty())
            .map(PathBuf::from)
            .ok_or_else(|| anyhow!("option 'location' is required"))?;
        Ok(Self {
            location,
            file: None,
            written: 0,
            name: String::new(),
        })
    }

    async fn sync(&mut self) -> Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.flush().await?;
            file.sync_all()
                .await
                .with_context(|| format!("sync of {} failed", self.location.display()))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Stage for FileSink {
    fn pads(&self) -> Pads {
        Pads::sink(Caps::any())
    }

    async fn start(&mut self, ctx: &StageContext) -> Result<()> {
        if let Some(parent) = self.location.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("cannot create {}", parent.display()))?;
        }
        let file = File::create(&self.location)
            .await
            .with_context(|| format!("cannot create {}", self.location.display()))?;
        info!("{}: writing to {}", ctx.name, self.location.display());
        self.file = Some(file);
        self.written = 0;
        self.name = ctx.name.clone();
        Ok(())
    }

    async fn push(&mut self, buffer: Buffer) -> Result<Vec<Buffer>> {
        let file = self.file.as_mut().ok_or_else(|| anyhow!("file is not open"))?;
        match buffer.offset {
            Some(offset) => {
                file.seek(SeekFrom::Start(offset)).await?;
                file.write_all(&buffer.data).await?;
                file.seek(SeekFrom::End(0)).await?;
            }
            None => {
                file.write_all(&buffer.data).await?;
                self.written += buffer.size() as u64;
            }
        }
        Ok(Vec::new())
    }

    async fn finish(&mut self) -> Result<Vec<Buffer>> {
        self.sync().await?;
        debug!("{}: {} bytes on disk", self.name, self.written);
        Ok(Vec::new())
    }

    async fn stop(&mut self) -> Result<()> {
        self.sync().await?;
        self.file = None;
        Ok(())
    }
}
