use crate::referee::BannedUtxo;
use anyhow::Result;
use bitcoin::OutPoint;
use std::path::Path;

/// Persistent ban registry, keyed by consensus-encoded outpoint.
pub struct Storage {
    db: sled::Db,
    bans: sled::Tree,
}

impl Storage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path)?;
        let bans = db.open_tree("bans")?;
        Ok(Self { db, bans })
    }

    /// In-memory database for tests and throwaway coordinators.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        let bans = db.open_tree("bans")?;
        Ok(Self { db, bans })
    }

    pub fn save_ban(&self, ban: &BannedUtxo) -> Result<()> {
        let bytes = bincode::serialize(ban)?;
        self.bans.insert(key(&ban.outpoint), bytes)?;
        Ok(())
    }

    pub fn remove_ban(&self, outpoint: &OutPoint) -> Result<()> {
        self.bans.remove(key(outpoint))?;
        Ok(())
    }

    pub fn load_bans(&self) -> Result<Vec<BannedUtxo>> {
        let mut bans = Vec::new();
        for entry in self.bans.iter() {
            let (_, bytes) = entry?;
            bans.push(bincode::deserialize(&bytes)?);
        }
        Ok(bans)
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

fn key(outpoint: &OutPoint) -> Vec<u8> {
    bitcoin::consensus::serialize(outpoint)
}
