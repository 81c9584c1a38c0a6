use std::io::Cursor;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::errors::WireError;

use super::{Token, MAX_LIST_DEPTH, MAX_STRING_LEN};

/// Reads [`Token`]s off an [`AsyncRead`] stream per the SVN wire grammar.
pub struct WireReader<R> {
    inner: R,
    max_string_len: u64,
    max_list_depth: u32,
    offset: u64,
    pending: Option<u8>,
}

impl<R: AsyncRead + Unpin> WireReader<R> {
    /// Construct a reader with the default safety bounds.
    pub fn new(inner: R) -> Self {
        Self::with_limits(inner, MAX_STRING_LEN, MAX_LIST_DEPTH)
    }

    /// Construct a reader with explicit safety bounds.
    pub fn with_limits(inner: R, max_string_len: u64, max_list_depth: u32) -> Self {
        Self {
            inner,
            max_string_len,
            max_list_depth,
            offset: 0,
            pending: None,
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    async fn raw_byte(&mut self) -> Result<u8, WireError> {
        let mut b = [0u8; 1];
        self.inner.read_exact(&mut b).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                WireError::UnexpectedEof("token")
            } else {
                WireError::IoError(e)
            }
        })?;
        self.offset += 1;
        Ok(b[0])
    }

    async fn next_byte(&mut self) -> Result<u8, WireError> {
        if let Some(b) = self.pending.take() {
            return Ok(b);
        }
        self.raw_byte().await
    }

    fn push_back(&mut self, b: u8) {
        self.pending = Some(b);
    }

    async fn next_nonspace(&mut self) -> Result<u8, WireError> {
        loop {
            let b = self.next_byte().await?;
            if b != b' ' {
                return Ok(b);
            }
        }
    }

    /// Read the next full token, recursing into nested lists.
    pub async fn read_token(&mut self) -> Result<Token, WireError> {
        self.read_token_at_depth(0).await
    }

    fn read_token_at_depth<'a>(
        &'a mut self,
        depth: u32,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Token, WireError>> + Send + 'a>>
    where
        R: Send,
    {
        Box::pin(async move {
            let first = self.next_nonspace().await?;
            match first {
                b'(' => {
                    if depth >= self.max_list_depth {
                        return Err(WireError::ListTooDeep(self.max_list_depth));
                    }
                    let mut items = Vec::new();
                    loop {
                        let b = self.next_nonspace().await?;
                        if b == b')' {
                            break;
                        }
                        self.push_back(b);
                        let item = self.read_token_at_depth(depth + 1).await?;
                        items.push(item);
                    }
                    Ok(Token::List(items))
                }
                b'0'..=b'9' => self.read_number_or_string(first).await,
                b'a'..=b'z' | b'A'..=b'Z' => self.read_word(first).await,
                other => Err(WireError::UnexpectedByte {
                    byte: other,
                    offset: self.offset,
                }),
            }
        })
    }

    async fn read_number_or_string(&mut self, first_digit: u8) -> Result<Token, WireError> {
        let mut digits = vec![first_digit];
        loop {
            let b = self.next_byte().await?;
            match b {
                b'0'..=b'9' => digits.push(b),
                b' ' => {
                    let text = String::from_utf8_lossy(&digits).into_owned();
                    let n: i64 = text
                        .parse()
                        .map_err(|_| WireError::InvalidNumber(text.clone()))?;
                    return Ok(Token::Number(n));
                }
                b':' => {
                    let text = String::from_utf8_lossy(&digits).into_owned();
                    let len: u64 = text
                        .parse()
                        .map_err(|_| WireError::InvalidNumber(text.clone()))?;
                    if len > self.max_string_len {
                        return Err(WireError::StringTooLong(len, self.max_string_len));
                    }
                    let mut payload = vec![0u8; len as usize];
                    self.inner.read_exact(&mut payload).await.map_err(|e| {
                        if e.kind() == std::io::ErrorKind::UnexpectedEof {
                            WireError::UnexpectedEof("string payload")
                        } else {
                            WireError::IoError(e)
                        }
                    })?;
                    self.offset += len;
                    let trailing = self.next_byte().await?;
                    if trailing != b' ' {
                        return Err(WireError::UnexpectedByte {
                            byte: trailing,
                            offset: self.offset,
                        });
                    }
                    return Ok(Token::String(payload));
                }
                other => {
                    return Err(WireError::UnexpectedByte {
                        byte: other,
                        offset: self.offset,
                    })
                }
            }
        }
    }

    async fn read_word(&mut self, first: u8) -> Result<Token, WireError> {
        let mut word = vec![first];
        loop {
            let b = self.next_byte().await?;
            if b == b' ' {
                return Ok(Token::Word(String::from_utf8_lossy(&word).into_owned()));
            } else if b.is_ascii_alphanumeric() || b == b'-' {
                word.push(b);
            } else {
                return Err(WireError::UnexpectedByte {
                    byte: b,
                    offset: self.offset,
                });
            }
        }
    }
}

impl<'a> WireReader<Cursor<&'a [u8]>> {
    /// Convenience constructor over an in-memory byte slice, mainly for
    /// tests.
    pub fn from_slice(bytes: &'a [u8]) -> Self {
        Self::new(Cursor::new(bytes))
    }
}
