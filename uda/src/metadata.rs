//! Catalog metadata sidecars, shipped in a fixed order after SERVER_BLOCK
//! when the client has asked for metadata.

use crate::errors::Result;
use crate::io::{UdaRead, UdaWrite};
use crate::protocol::{write_header, ProtocolId};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataSystem {
    pub system_id: i32,
    pub version: i32,
    pub device_name: String,
    pub system_name: String,
    pub description: String,
}

impl DataSystem {
    pub async fn write<W: UdaWrite>(&self, writer: &mut W, negotiated: u32) -> Result<()> {
        write_header(writer, ProtocolId::DataSystem, negotiated).await?;
        writer.write_i32_be(self.system_id).await?;
        writer.write_i32_be(self.version).await?;
        writer.write_str(&self.device_name).await?;
        writer.write_str(&self.system_name).await?;
        writer.write_str(&self.description).await?;
        Ok(())
    }

    pub async fn read<R: UdaRead>(reader: &mut R) -> Result<Self> {
        Ok(DataSystem {
            system_id: reader.read_i32_be().await?,
            version: reader.read_i32_be().await?,
            device_name: reader.read_str().await?,
            system_name: reader.read_str().await?,
            description: reader.read_str().await?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SystemConfig {
    pub config_id: i32,
    pub system_id: i32,
    pub config_name: String,
    pub description: String,
}

impl SystemConfig {
    pub async fn write<W: UdaWrite>(&self, writer: &mut W, negotiated: u32) -> Result<()> {
        write_header(writer, ProtocolId::SystemConfig, negotiated).await?;
        writer.write_i32_be(self.config_id).await?;
        writer.write_i32_be(self.system_id).await?;
        writer.write_str(&self.config_name).await?;
        writer.write_str(&self.description).await?;
        Ok(())
    }

    pub async fn read<R: UdaRead>(reader: &mut R) -> Result<Self> {
        Ok(SystemConfig {
            config_id: reader.read_i32_be().await?,
            system_id: reader.read_i32_be().await?,
            config_name: reader.read_str().await?,
            description: reader.read_str().await?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataSource {
    pub source_id: i32,
    pub exp_number: i32,
    pub pass: i32,
    pub source_alias: String,
    pub format: String,
    pub filename: String,
    pub path: String,
    pub status: i32,
}

impl DataSource {
    pub async fn write<W: UdaWrite>(&self, writer: &mut W, negotiated: u32) -> Result<()> {
        write_header(writer, ProtocolId::DataSource, negotiated).await?;
        writer.write_i32_be(self.source_id).await?;
        writer.write_i32_be(self.exp_number).await?;
        writer.write_i32_be(self.pass).await?;
        writer.write_str(&self.source_alias).await?;
        writer.write_str(&self.format).await?;
        writer.write_str(&self.filename).await?;
        writer.write_str(&self.path).await?;
        writer.write_i32_be(self.status).await?;
        Ok(())
    }

    pub async fn read<R: UdaRead>(reader: &mut R) -> Result<Self> {
        Ok(DataSource {
            source_id: reader.read_i32_be().await?,
            exp_number: reader.read_i32_be().await?,
            pass: reader.read_i32_be().await?,
            source_alias: reader.read_str().await?,
            format: reader.read_str().await?,
            filename: reader.read_str().await?,
            path: reader.read_str().await?,
            status: reader.read_i32_be().await?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SignalRec {
    pub source_id: i32,
    pub signal_desc_id: i32,
    pub status: i32,
    pub xml: String,
}

impl SignalRec {
    pub async fn write<W: UdaWrite>(&self, writer: &mut W, negotiated: u32) -> Result<()> {
        write_header(writer, ProtocolId::Signal, negotiated).await?;
        writer.write_i32_be(self.source_id).await?;
        writer.write_i32_be(self.signal_desc_id).await?;
        writer.write_i32_be(self.status).await?;
        writer.write_str(&self.xml).await?;
        Ok(())
    }

    pub async fn read<R: UdaRead>(reader: &mut R) -> Result<Self> {
        Ok(SignalRec {
            source_id: reader.read_i32_be().await?,
            signal_desc_id: reader.read_i32_be().await?,
            status: reader.read_i32_be().await?,
            xml: reader.read_str().await?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SignalDesc {
    pub signal_desc_id: i32,
    pub signal_name: String,
    pub generic_name: String,
    pub signal_alias: String,
    pub description: String,
    pub xml: String,
}

impl SignalDesc {
    pub async fn write<W: UdaWrite>(&self, writer: &mut W, negotiated: u32) -> Result<()> {
        write_header(writer, ProtocolId::SignalDesc, negotiated).await?;
        writer.write_i32_be(self.signal_desc_id).await?;
        writer.write_str(&self.signal_name).await?;
        writer.write_str(&self.generic_name).await?;
        writer.write_str(&self.signal_alias).await?;
        writer.write_str(&self.description).await?;
        writer.write_str(&self.xml).await?;
        Ok(())
    }

    pub async fn read<R: UdaRead>(reader: &mut R) -> Result<Self> {
        Ok(SignalDesc {
            signal_desc_id: reader.read_i32_be().await?,
            signal_name: reader.read_str().await?,
            generic_name: reader.read_str().await?,
            signal_alias: reader.read_str().await?,
            description: reader.read_str().await?,
            xml: reader.read_str().await?,
        })
    }
}

/// The five sidecars as attached to a client-side DataBlock.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataBlocks {
    pub data_system: DataSystem,
    pub system_config: SystemConfig,
    pub data_source: DataSource,
    pub signal_rec: SignalRec,
    pub signal_desc: SignalDesc,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::UdaRead;
    use crate::protocol::{expect_header, CLIENT_VERSION};

    #[tokio::test]
    async fn sidecars_round_trip() {
        let data_source = DataSource {
            source_id: 7,
            exp_number: 12345,
            pass: 2,
            source_alias: "amc".to_string(),
            format: "netcdf".to_string(),
            filename: "run.nc".to_string(),
            path: "/data/run.nc".to_string(),
            status: 1,
        };
        let signal_desc = SignalDesc {
            signal_desc_id: 3,
            signal_name: "ip".to_string(),
            generic_name: "plasma current".to_string(),
            ..Default::default()
        };

        let mut buf = Vec::new();
        data_source.write(&mut buf, CLIENT_VERSION).await.unwrap();
        signal_desc.write(&mut buf, CLIENT_VERSION).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        expect_header(&mut cursor, ProtocolId::DataSource)
            .await
            .unwrap();
        assert_eq!(DataSource::read(&mut cursor).await.unwrap(), data_source);
        expect_header(&mut cursor, ProtocolId::SignalDesc)
            .await
            .unwrap();
        assert_eq!(SignalDesc::read(&mut cursor).await.unwrap(), signal_desc);
    }

    #[tokio::test]
    async fn system_records_round_trip() {
        let data_system = DataSystem {
            system_id: 1,
            version: 4,
            device_name: "MAST".to_string(),
            system_name: "magnetics".to_string(),
            description: String::new(),
        };
        let system_config = SystemConfig {
            config_id: 9,
            system_id: 1,
            config_name: "default".to_string(),
            description: String::new(),
        };
        let signal_rec = SignalRec {
            source_id: 7,
            signal_desc_id: 3,
            status: 1,
            xml: String::new(),
        };

        let mut buf = Vec::new();
        data_system.write(&mut buf, CLIENT_VERSION).await.unwrap();
        system_config.write(&mut buf, CLIENT_VERSION).await.unwrap();
        signal_rec.write(&mut buf, CLIENT_VERSION).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        expect_header(&mut cursor, ProtocolId::DataSystem)
            .await
            .unwrap();
        assert_eq!(DataSystem::read(&mut cursor).await.unwrap(), data_system);
        expect_header(&mut cursor, ProtocolId::SystemConfig)
            .await
            .unwrap();
        assert_eq!(SystemConfig::read(&mut cursor).await.unwrap(), system_config);
        expect_header(&mut cursor, ProtocolId::Signal).await.unwrap();
        assert_eq!(SignalRec::read(&mut cursor).await.unwrap(), signal_rec);
        // Nothing left on the wire.
        assert!(cursor.read_u32_be().await.is_err());
    }
}
