use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::{Result, UdaError};
use crate::protocol::MAX_STRING_SIZE;

/// Read half of the wire codec. All atomic types are big-endian fixed width;
/// strings and byte vectors are u32-length-prefixed.
#[async_trait::async_trait]
pub trait UdaRead: AsyncRead + Unpin + Send + Sync + 'static {
    async fn read_u8_byte(&mut self) -> Result<u8>;
    async fn read_u16_be(&mut self) -> Result<u16>;
    async fn read_u32_be(&mut self) -> Result<u32>;
    async fn read_u64_be(&mut self) -> Result<u64>;
    async fn read_i32_be(&mut self) -> Result<i32>;
    async fn read_i64_be(&mut self) -> Result<i64>;
    async fn read_f32_be(&mut self) -> Result<f32>;
    async fn read_f64_be(&mut self) -> Result<f64>;

    /// Length-prefixed UTF-8. There is no terminator on the wire; the decode
    /// enforces the cap, valid UTF-8 and the absence of embedded NULs.
    async fn read_str(&mut self) -> Result<String>;

    async fn read_bytes(&mut self) -> Result<Vec<u8>>;
}

#[async_trait::async_trait]
impl<T: AsyncRead + Unpin + Send + Sync + 'static> UdaRead for T {
    async fn read_u8_byte(&mut self) -> Result<u8> {
        Ok(self.read_u8().await?)
    }

    async fn read_u16_be(&mut self) -> Result<u16> {
        Ok(self.read_u16().await?)
    }

    async fn read_u32_be(&mut self) -> Result<u32> {
        Ok(self.read_u32().await?)
    }

    async fn read_u64_be(&mut self) -> Result<u64> {
        Ok(self.read_u64().await?)
    }

    async fn read_i32_be(&mut self) -> Result<i32> {
        Ok(self.read_i32().await?)
    }

    async fn read_i64_be(&mut self) -> Result<i64> {
        Ok(self.read_i64().await?)
    }

    async fn read_f32_be(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.read_u32().await?))
    }

    async fn read_f64_be(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.read_u64().await?))
    }

    async fn read_str(&mut self) -> Result<String> {
        let len = self.read_u32().await? as usize;
        if len > MAX_STRING_SIZE {
            return Err(UdaError::Protocol(format!(
                "string too large: {len} > {MAX_STRING_SIZE}"
            )));
        }
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf[..]).await?;
        if buf.contains(&0) {
            return Err(UdaError::Protocol(
                "string contains an embedded terminator".to_string(),
            ));
        }
        String::from_utf8(buf).map_err(|e| UdaError::Protocol(format!("invalid utf-8 string: {e}")))
    }

    async fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u32().await? as usize;
        if len > MAX_STRING_SIZE {
            return Err(UdaError::Protocol(format!(
                "binary too large: {len} > {MAX_STRING_SIZE}"
            )));
        }
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf[..]).await?;
        Ok(buf)
    }
}

/// Write half of the wire codec.
#[async_trait::async_trait]
pub trait UdaWrite: AsyncWrite + Unpin + Send + Sync + 'static {
    async fn write_u8_byte(&mut self, value: u8) -> Result<()>;
    async fn write_u16_be(&mut self, value: u16) -> Result<()>;
    async fn write_u32_be(&mut self, value: u32) -> Result<()>;
    async fn write_u64_be(&mut self, value: u64) -> Result<()>;
    async fn write_i32_be(&mut self, value: i32) -> Result<()>;
    async fn write_i64_be(&mut self, value: i64) -> Result<()>;
    async fn write_f32_be(&mut self, value: f32) -> Result<()>;
    async fn write_f64_be(&mut self, value: f64) -> Result<()>;
    async fn write_str(&mut self, value: &str) -> Result<()>;
    async fn write_bytes(&mut self, value: &[u8]) -> Result<()>;
}

#[async_trait::async_trait]
impl<T: AsyncWrite + Unpin + Send + Sync + 'static> UdaWrite for T {
    async fn write_u8_byte(&mut self, value: u8) -> Result<()> {
        Ok(self.write_u8(value).await?)
    }

    async fn write_u16_be(&mut self, value: u16) -> Result<()> {
        Ok(self.write_u16(value).await?)
    }

    async fn write_u32_be(&mut self, value: u32) -> Result<()> {
        Ok(self.write_u32(value).await?)
    }

    async fn write_u64_be(&mut self, value: u64) -> Result<()> {
        Ok(self.write_u64(value).await?)
    }

    async fn write_i32_be(&mut self, value: i32) -> Result<()> {
        Ok(self.write_i32(value).await?)
    }

    async fn write_i64_be(&mut self, value: i64) -> Result<()> {
        Ok(self.write_i64(value).await?)
    }

    async fn write_f32_be(&mut self, value: f32) -> Result<()> {
        Ok(self.write_u32(value.to_bits()).await?)
    }

    async fn write_f64_be(&mut self, value: f64) -> Result<()> {
        Ok(self.write_u64(value.to_bits()).await?)
    }

    async fn write_str(&mut self, value: &str) -> Result<()> {
        self.write_u32(value.len() as u32).await?;
        self.write_all(value.as_bytes()).await?;
        Ok(())
    }

    async fn write_bytes(&mut self, value: &[u8]) -> Result<()> {
        self.write_u32(value.len() as u32).await?;
        self.write_all(value).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn strings_and_scalars_round_trip() {
        let mut buf = Vec::new();
        buf.write_u32_be(0xDEAD_BEEF).await.unwrap();
        buf.write_i32_be(-17).await.unwrap();
        buf.write_f64_be(3.25).await.unwrap();
        buf.write_str("te::st").await.unwrap();
        buf.write_bytes(&[1, 2, 3]).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        assert_eq!(cursor.read_u32_be().await.unwrap(), 0xDEAD_BEEF);
        assert_eq!(cursor.read_i32_be().await.unwrap(), -17);
        assert_eq!(cursor.read_f64_be().await.unwrap(), 3.25);
        assert_eq!(cursor.read_str().await.unwrap(), "te::st");
        assert_eq!(cursor.read_bytes().await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn embedded_terminator_is_rejected() {
        let mut buf = Vec::new();
        buf.write_u32_be(3).await.unwrap();
        buf.extend_from_slice(b"a\0b");
        let mut cursor = std::io::Cursor::new(buf);
        assert!(cursor.read_str().await.is_err());
    }
}
